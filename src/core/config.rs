//! Configuration parsing and validation.
//!
//! The liaison is configured from a single TOML file. Every section is
//! optional and falls back to defaults; the `catalog` section bootstraps the
//! embedded schema, group and node registries.

use crate::control::groups::GroupSpec;
use crate::control::placement::NodeInfo;
use crate::control::schema::{EntityLocator, StreamSchema};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener configurations.
    #[serde(default)]
    pub listeners: ListenersConfig,

    /// Write ingestion settings.
    #[serde(default)]
    pub write: WriteConfig,

    /// Query settings.
    #[serde(default)]
    pub query: QueryConfig,

    /// Ingestion access log.
    #[serde(default)]
    pub access_log: AccessLogConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Embedded catalog.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Listener configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenersConfig {
    /// gRPC listener for the stream service.
    #[serde(default)]
    pub grpc: GrpcListenerConfig,
}

/// gRPC listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcListenerConfig {
    #[serde(default = "default_grpc_bind")]
    pub bind: String,
}

impl Default for GrpcListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_grpc_bind(),
        }
    }
}

/// Write ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Deadline handed to every batch publisher.
    #[serde(default = "default_write_timeout_ms")]
    pub timeout_ms: u64,

    /// Messages buffered per node by the embedded transport before a flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_write_timeout_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl WriteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Query settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Upper bound for awaiting a broadcast result.
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Ingestion access log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Directory holding the log files.
    #[serde(default = "default_access_log_root")]
    pub root: String,

    /// Minutes before a new file is started.
    #[serde(default = "default_rotation_minutes")]
    pub rotation_minutes: u64,

    /// Records queued for the writer before new ones are dropped.
    #[serde(default = "default_access_log_buffer")]
    pub buffer: usize,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            root: default_access_log_root(),
            rotation_minutes: default_rotation_minutes(),
            buffer: default_access_log_buffer(),
        }
    }
}

impl AccessLogConfig {
    pub fn rotation(&self) -> Duration {
        Duration::from_secs(self.rotation_minutes.saturating_mul(60))
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit one of every N per-message write error logs.
    #[serde(default = "default_log_sample_every")]
    pub log_sample_every: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_sample_every: default_log_sample_every(),
        }
    }
}

/// Groups, streams and data nodes known at start-up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub groups: Vec<GroupSpec>,

    #[serde(default)]
    pub streams: Vec<StreamSchema>,

    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}

// Default value functions

fn default_grpc_bind() -> String {
    "0.0.0.0:17912".to_string()
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    64
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_access_log_root() -> String {
    "data/accesslog".to_string()
}

fn default_rotation_minutes() -> u64 {
    10
}

fn default_access_log_buffer() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_sample_every() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref grpc_bind) = overrides.grpc_bind {
            self.listeners.grpc.bind = grpc_bind.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_telemetry()?;
        self.validate_timeouts()?;
        self.validate_access_log()?;
        self.validate_catalog()?;
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<()> {
        if self.write.timeout_ms == 0 {
            anyhow::bail!("write.timeout_ms must be > 0");
        }
        if self.query.timeout_ms == 0 {
            anyhow::bail!("query.timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_access_log(&self) -> Result<()> {
        if self.access_log.enabled && self.access_log.rotation_minutes == 0 {
            anyhow::bail!("access_log.rotation_minutes must be > 0 when the access log is enabled");
        }
        Ok(())
    }

    fn validate_catalog(&self) -> Result<()> {
        let mut groups = HashSet::new();
        for group in &self.catalog.groups {
            if group.shard_num == 0 {
                anyhow::bail!("catalog group {} must have shard_num > 0", group.name);
            }
            if !groups.insert(group.name.as_str()) {
                anyhow::bail!("catalog group {} declared twice", group.name);
            }
        }

        for stream in &self.catalog.streams {
            if !groups.contains(stream.group.as_str()) {
                anyhow::bail!(
                    "catalog stream {}/{} references undeclared group {}",
                    stream.group,
                    stream.name,
                    stream.group
                );
            }
            EntityLocator::new(stream)
                .with_context(|| format!("catalog stream {}/{}", stream.group, stream.name))?;
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override gRPC bind address.
    pub grpc_bind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[listeners.grpc]
bind = "127.0.0.1:17912"

[write]
timeout_ms = 2000

[[catalog.groups]]
name = "sw"
shard_num = 2
stages = [{ name = "warm", node_selector = "type=warm" }]

[[catalog.streams]]
group = "sw"
name = "log"
mod_revision = 1
entity = ["service_id"]
tag_families = [{ name = "default", tags = ["service_id", "trace_id"] }]

[[catalog.nodes]]
id = "data-0"
labels = { type = "hot" }
"#;

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listeners.grpc.bind, "0.0.0.0:17912");
        assert_eq!(config.write.timeout(), Duration::from_secs(5));
        assert_eq!(config.write.batch_size, 64);
        assert_eq!(config.query.timeout(), Duration::from_secs(30));
        assert!(!config.access_log.enabled);
        assert_eq!(config.access_log.rotation(), Duration::from_secs(600));
        assert_eq!(config.telemetry.log_sample_every, 10);
        assert!(config.catalog.streams.is_empty());
    }

    #[test]
    fn sample_catalog_parses() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.write.timeout_ms, 2000);
        assert_eq!(config.catalog.groups[0].stages[0].node_selector, "type=warm");
        assert_eq!(config.catalog.streams[0].entity, vec!["service_id"]);
        assert_eq!(config.catalog.nodes[0].labels["type"], "hot");
    }

    #[test]
    fn rejects_unknown_log_level() {
        let err = Config::from_toml("[telemetry]\nlog_level = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("telemetry.log_level"));
    }

    #[test]
    fn rejects_zero_timeouts() {
        assert!(Config::from_toml("[write]\ntimeout_ms = 0").is_err());
        assert!(Config::from_toml("[query]\ntimeout_ms = 0").is_err());
    }

    #[test]
    fn rotation_only_checked_when_enabled() {
        assert!(Config::from_toml("[access_log]\nrotation_minutes = 0").is_ok());
        assert!(Config::from_toml("[access_log]\nenabled = true\nrotation_minutes = 0").is_err());
    }

    #[test]
    fn stream_must_reference_declared_group() {
        let toml = r#"
[[catalog.streams]]
group = "missing"
name = "log"
mod_revision = 1
entity = []
tag_families = []
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("undeclared group"));
    }

    #[test]
    fn entity_tags_must_be_declared() {
        let toml = r#"
[[catalog.groups]]
name = "sw"
shard_num = 1

[[catalog.streams]]
group = "sw"
name = "log"
mod_revision = 1
entity = ["host"]
tag_families = [{ name = "default", tags = ["service_id"] }]
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn zero_shards_rejected() {
        let toml = "[[catalog.groups]]\nname = \"sw\"\nshard_num = 0\n";
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn overrides_replace_values() {
        let mut config = Config::default();
        config.apply_overrides(&ConfigOverrides {
            log_level: Some("debug".to_string()),
            grpc_bind: Some("127.0.0.1:1".to_string()),
        });
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.listeners.grpc.bind, "127.0.0.1:1");
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("liaison.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.listeners.grpc.bind, "127.0.0.1:17912");
        assert!(Config::from_file(&dir.path().join("absent.toml")).is_err());
    }
}
