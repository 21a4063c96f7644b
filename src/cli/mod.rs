//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// Liaison - write and query gateway for a distributed time-series database.
#[derive(Parser, Debug)]
#[command(name = "liaison")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the liaison server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_with_overrides() {
        let cli = Cli::parse_from([
            "liaison",
            "--config",
            "liaison.toml",
            "--log-level",
            "debug",
            "start",
            "--grpc-bind",
            "127.0.0.1:1",
        ]);
        assert_eq!(cli.config.as_deref(), Some("liaison.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Start(args) => assert_eq!(args.grpc_bind.as_deref(), Some("127.0.0.1:1")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parses_config_show() {
        let cli = Cli::parse_from(["liaison", "config", "show", "--format", "json"]);
        assert!(matches!(cli.command, Commands::Config(_)));
    }
}
