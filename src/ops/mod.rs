//! Operations and observability.
//!
//! This module handles operational concerns:
//! - [`observability`] - Labelled metrics and Prometheus export
//! - [`telemetry`] - Sampled logging and request tracing
//! - [`accesslog`] - Ingestion access log

pub mod accesslog;
pub mod observability;
pub mod telemetry;
