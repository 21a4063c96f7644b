//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component wiring and lifecycle
//! - [`time`] - Timestamp and time range validation
//! - [`error`] - Error types and adapter-specific mapping

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
