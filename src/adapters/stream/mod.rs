//! Stream service.
//!
//! Serves the two stream RPCs:
//! - `Write`: bidirectional stream of [`WriteRequest`](proto::WriteRequest)s,
//!   one [`WriteResponse`](proto::WriteResponse) per request ([`write`])
//! - `Query`: unary fan-out to the data nodes serving the requested groups
//!   ([`query`])
//!
//! [`StreamService`] holds the collaborators both RPCs share; [`grpc`] binds
//! it to tonic.

pub mod proto;
pub mod query;
pub mod write;

#[cfg(feature = "grpc")]
pub mod grpc;

use crate::bus::{Broadcaster, Pipeline};
use crate::control::groups::GroupRegistry;
use crate::control::placement::NodeRegistry;
use crate::control::routing::WriteResolver;
use crate::control::schema::SchemaCache;
use crate::ops::accesslog::AccessLog;
use crate::ops::observability::LiaisonMetrics;
use crate::ops::telemetry::{LogSampler, DEFAULT_LOG_SAMPLE_EVERY};
use std::sync::Arc;
use std::time::Duration;

/// Default batch publisher timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default upper bound for awaiting a query result.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Read-only registries consulted per request.
#[derive(Clone)]
pub struct Registries {
    pub schemas: Arc<dyn SchemaCache>,
    pub groups: Arc<dyn GroupRegistry>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub resolver: Arc<dyn WriteResolver>,
}

/// Stream write and query service.
pub struct StreamService {
    registries: Registries,
    pipeline: Arc<dyn Pipeline>,
    broadcaster: Arc<dyn Broadcaster>,
    access_log: Option<Arc<dyn AccessLog>>,
    metrics: Arc<LiaisonMetrics>,
    sampled: LogSampler,
    write_timeout: Duration,
    query_timeout: Duration,
}

impl StreamService {
    pub fn new(
        registries: Registries,
        pipeline: Arc<dyn Pipeline>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            registries,
            pipeline,
            broadcaster,
            access_log: None,
            metrics: Arc::new(LiaisonMetrics::new()),
            sampled: LogSampler::new(DEFAULT_LOG_SAMPLE_EVERY),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Record every routed write to `log` before publishing it.
    pub fn with_access_log(mut self, log: Arc<dyn AccessLog>) -> Self {
        self.access_log = Some(log);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LiaisonMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Log one of every `every` per-message write errors.
    pub fn with_log_sample_every(mut self, every: u64) -> Self {
        self.sampled = LogSampler::new(every);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn metrics(&self) -> &Arc<LiaisonMetrics> {
        &self.metrics
    }

    /// Release resources held by the service.
    pub fn close(&self) -> anyhow::Result<()> {
        if let Some(log) = &self.access_log {
            log.close()?;
        }
        Ok(())
    }
}
