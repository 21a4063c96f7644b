//! Write routing.
//!
//! A write is routed by its entity: the stream name followed by the values
//! of the stream's entity tags. The entity is hashed with xxHash64:
//! `shard = hash64(entity) % group_shard_num`, and the same hash, big-endian,
//! becomes the series hash carried to the data node.

use crate::control::groups::GroupRegistry;
use crate::control::schema::{SchemaCache, SchemaId};
use crate::core::error::{LiaisonError, LiaisonResult};
use crate::proto::{Metadata, TagFamilyForWrite, TagValue};
use prost::Message;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Routing facts derived from one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWrite {
    pub shard_id: u32,
    pub series_hash: Vec<u8>,
    /// Entity tag values without the leading stream name.
    pub entity_values: Vec<TagValue>,
}

/// Turns write metadata and tags into routing facts.
pub trait WriteResolver: Send + Sync {
    fn resolve(
        &self,
        metadata: &Metadata,
        tag_families: &[TagFamilyForWrite],
    ) -> LiaisonResult<ResolvedWrite>;
}

/// Hash an entity (stream name then entity values).
pub fn hash_entity(entity: &[TagValue]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    for value in entity {
        hasher.write(&value.encode_length_delimited_to_vec());
    }
    hasher.finish()
}

/// Resolver backed by the schema cache and group registry.
pub struct EntityResolver {
    schemas: Arc<dyn SchemaCache>,
    groups: Arc<dyn GroupRegistry>,
}

impl EntityResolver {
    pub fn new(schemas: Arc<dyn SchemaCache>, groups: Arc<dyn GroupRegistry>) -> Self {
        Self { schemas, groups }
    }
}

impl WriteResolver for EntityResolver {
    fn resolve(
        &self,
        metadata: &Metadata,
        tag_families: &[TagFamilyForWrite],
    ) -> LiaisonResult<ResolvedWrite> {
        let id = SchemaId::from(metadata);
        let locator = self
            .schemas
            .lookup(&id)
            .ok_or_else(|| LiaisonError::resolve(format!("stream {} is not registered", id)))?;
        let shard_num = match self.groups.shard_num(&metadata.group) {
            Some(0) => {
                return Err(LiaisonError::resolve(format!(
                    "group {} has no shards",
                    metadata.group
                )))
            }
            Some(n) => n,
            None => {
                return Err(LiaisonError::resolve(format!(
                    "group {} is not registered",
                    metadata.group
                )))
            }
        };

        let entity_values = locator.find_entity_values(tag_families)?;
        let mut entity = Vec::with_capacity(entity_values.len() + 1);
        entity.push(TagValue::str(metadata.name.clone()));
        entity.extend(entity_values.iter().cloned());

        let hash = hash_entity(&entity);
        Ok(ResolvedWrite {
            shard_id: (hash % u64::from(shard_num)) as u32,
            series_hash: hash.to_be_bytes().to_vec(),
            entity_values,
        })
    }
}
