//! Stream schema cache.
//!
//! The liaison keeps a read-mostly copy of every stream schema it may route
//! writes for. Each entry is reduced to an [`EntityLocator`]: the schema's
//! revision plus the positions of its entity tags inside a write's tag
//! families. Entries change through [`SchemaEvent`]s delivered by schema
//! discovery and are read concurrently by every write stream.

use crate::core::error::{LiaisonError, LiaisonResult};
use crate::proto::{Metadata, TagFamilyForWrite, TagValue};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies a stream: `name` within `group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId {
    pub group: String,
    pub name: String,
}

impl SchemaId {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl From<&Metadata> for SchemaId {
    fn from(metadata: &Metadata) -> Self {
        Self::new(metadata.group.clone(), metadata.name.clone())
    }
}

impl std::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Declared tag family: its name and ordered tag names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFamilySpec {
    pub name: String,
    pub tags: Vec<String>,
}

/// A stream schema as delivered by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSchema {
    pub group: String,
    pub name: String,
    pub mod_revision: i64,
    pub tag_families: Vec<TagFamilySpec>,
    /// Entity tag names, in entity order.
    pub entity: Vec<String>,
}

impl StreamSchema {
    pub fn id(&self) -> SchemaId {
        SchemaId::new(self.group.clone(), self.name.clone())
    }
}

/// Position of one entity tag inside a write's tag families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLocation {
    pub family: usize,
    pub tag: usize,
}

/// What the write path needs from a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityLocator {
    pub id: SchemaId,
    pub mod_revision: i64,
    pub entity_tags: Vec<String>,
    locations: Vec<TagLocation>,
}

impl EntityLocator {
    /// Build a locator, failing if an entity tag is not declared.
    pub fn new(schema: &StreamSchema) -> LiaisonResult<Self> {
        let locations = schema
            .entity
            .iter()
            .map(|tag_name| {
                schema
                    .tag_families
                    .iter()
                    .enumerate()
                    .find_map(|(family, spec)| {
                        spec.tags
                            .iter()
                            .position(|t| t == tag_name)
                            .map(|tag| TagLocation { family, tag })
                    })
                    .ok_or_else(|| LiaisonError::InvalidRequest {
                        message: format!(
                            "entity tag {} is not declared by stream {}",
                            tag_name,
                            schema.id()
                        ),
                    })
            })
            .collect::<LiaisonResult<Vec<_>>>()?;

        Ok(Self {
            id: schema.id(),
            mod_revision: schema.mod_revision,
            entity_tags: schema.entity.clone(),
            locations,
        })
    }

    pub fn locations(&self) -> &[TagLocation] {
        &self.locations
    }

    /// Pick the entity tag values out of a write, in entity order.
    pub fn find_entity_values(&self, families: &[TagFamilyForWrite]) -> LiaisonResult<Vec<TagValue>> {
        self.locations
            .iter()
            .zip(&self.entity_tags)
            .map(|(loc, tag_name)| {
                let value = families
                    .get(loc.family)
                    .and_then(|f| f.tags.get(loc.tag))
                    .ok_or_else(|| {
                        LiaisonError::resolve(format!("entity tag {} is missing", tag_name))
                    })?;
                if value.is_null() {
                    return Err(LiaisonError::resolve(format!(
                        "entity tag {} is null",
                        tag_name
                    )));
                }
                Ok(value.clone())
            })
            .collect()
    }
}

/// Schema discovery events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaEvent {
    Upsert(StreamSchema),
    Delete(SchemaId),
}

/// Read side of the schema cache.
pub trait SchemaCache: Send + Sync {
    fn lookup(&self, id: &SchemaId) -> Option<Arc<EntityLocator>>;
}

/// In-memory schema cache fed by [`SchemaEvent`]s.
#[derive(Debug, Default)]
pub struct EntityRepository {
    entries: RwLock<HashMap<SchemaId, Arc<EntityLocator>>>,
}

impl EntityRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one discovery event.
    pub fn apply(&self, event: SchemaEvent) -> LiaisonResult<()> {
        match event {
            SchemaEvent::Upsert(schema) => {
                let locator = EntityLocator::new(&schema)?;
                tracing::debug!(
                    stream = %locator.id,
                    mod_revision = locator.mod_revision,
                    "schema upserted"
                );
                self.entries
                    .write()
                    .insert(locator.id.clone(), Arc::new(locator));
            }
            SchemaEvent::Delete(id) => {
                if self.entries.write().remove(&id).is_some() {
                    tracing::debug!(stream = %id, "schema deleted");
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl SchemaCache for EntityRepository {
    fn lookup(&self, id: &SchemaId) -> Option<Arc<EntityLocator>> {
        self.entries.read().get(id).cloned()
    }
}
