//! Liaison - the client-facing tier of a distributed time-series database.
//!
//! The liaison accepts stream writes and queries from clients and relays them
//! to the data nodes that own the data. It holds no data itself: every write
//! is routed to the node owning its shard, and every query is broadcast to
//! the nodes serving the requested groups and answered from their merged
//! results.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Stream gRPC (Write stream, Query)               │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Stream Service                           │
//! │   write: validate → route → publish → deferred per-node reply   │
//! │   query: validate → select nodes → broadcast → merged result    │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                                       │
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │       Control registries     │   │           Message bus        │
//! │ schemas │ groups │ placement │   │  batch publish │ broadcast   │
//! └──────────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Component wiring and lifecycle
//! - [`core::time`] - Timestamp and time range validation
//! - [`core::error`] - Error types and mapping
//!
//! ## Control
//! - [`control::schema`] - Schema cache and entity locators
//! - [`control::groups`] - Group stages and node selectors
//! - [`control::placement`] - Shard to node placement
//! - [`control::routing`] - Entity, shard and series resolution
//!
//! ## Bus
//! - [`bus`] - Publisher, broadcaster and query future contracts
//! - [`bus::local`] - In-process transport
//!
//! ## Adapters
//! - [`adapters::stream`] - Stream write and query service, gRPC binding
//!
//! ## Operations
//! - [`ops::observability`] - Metrics
//! - [`ops::telemetry`] - Log sampling and query tracing
//! - [`ops::accesslog`] - Ingestion access log
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations

// Core infrastructure
pub mod core;

// Schema, group and node registries
pub mod control;

// Transport to data nodes
pub mod bus;

// Protocol adapters
pub mod adapters;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use adapters::stream::proto;
pub use adapters::stream::StreamService;
pub use control::{groups, placement, routing, schema};
pub use ops::{accesslog, observability, telemetry};
