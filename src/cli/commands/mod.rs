//! CLI command implementations.

mod config;
mod start;

pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use start::{run_start_with_config, StartArgs};
