//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate,
    /// Print configuration with defaults.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command against `path`.
pub fn run_config(args: ConfigArgs, path: &Path) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(path),
        ConfigCommand::Show { format } => {
            println!("{}", render_config(path, &format)?);
            Ok(())
        }
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;
    println!("✓ Configuration is valid");
    println!(
        "  {} group(s), {} stream(s), {} node(s)",
        config.catalog.groups.len(),
        config.catalog.streams.len(),
        config.catalog.nodes.len()
    );
    if config.catalog.nodes.is_empty() {
        println!("  ⚠ Warning: no data nodes configured, every write will be rejected");
    }
    Ok(())
}

fn render_config(path: &Path, format: &str) -> Result<String> {
    let config = Config::from_file(path)?;
    let rendered = match format {
        "json" => serde_json::to_string_pretty(&config)?,
        "toml" => toml::to_string_pretty(&config)?,
        other => anyhow::bail!("unknown format: {}", other),
    };
    Ok(rendered)
}
