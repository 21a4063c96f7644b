//! Liaison - unified CLI entrypoint.
//!
//! Usage:
//!   liaison start --config config/liaison.toml
//!   liaison config validate --config config/liaison.toml
//!   liaison config show --config config/liaison.toml --format json

use anyhow::Result;
use clap::Parser;
use liaison::cli::commands::{run_config, run_start_with_config};
use liaison::cli::{Cli, Commands};
use liaison::config::ConfigOverrides;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/liaison.toml"));

    match cli.command {
        Commands::Start(args) => {
            let overrides = ConfigOverrides {
                log_level: cli.log_level,
                grpc_bind: args.grpc_bind,
            };
            run_start_with_config(&config_path, &overrides).await
        }
        Commands::Config(args) => run_config(args, &config_path),
    }
}
