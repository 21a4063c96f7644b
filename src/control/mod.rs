//! Control plane lookups.
//!
//! Read-mostly registries the liaison consults on every request:
//! - [`schema`] - Stream schema cache and entity locators
//! - [`groups`] - Group shard counts and stage node selectors
//! - [`placement`] - Shard to node placement
//! - [`routing`] - Entity resolution, shard ids and series hashes
//!
//! Each registry is updated through discovery events and read concurrently
//! by every write stream and query.

pub mod groups;
pub mod placement;
pub mod routing;
pub mod schema;
