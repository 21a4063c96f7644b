//! Group registry.
//!
//! A group owns a shard count and a set of lifecycle stages. Each stage names
//! a node selector (`key=value[,key=value...]`) that picks the data nodes
//! serving that stage. Queries resolve their candidate nodes here; a group or
//! stage without a selector leaves every node eligible.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One lifecycle stage of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub node_selector: String,
}

/// Group resource options as delivered by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub shard_num: u32,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

/// Group discovery events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Upsert(GroupSpec),
    Delete(String),
}

/// Read side of the group registry.
pub trait GroupRegistry: Send + Sync {
    /// Selectors for the requested stages of `group`, or `None` when there is
    /// no mapping (the group is unknown or none of the stages has a selector).
    fn node_selector(&self, group: &str, stages: &[String]) -> Option<Vec<String>>;

    fn shard_num(&self, group: &str) -> Option<u32>;
}

/// In-memory group registry fed by [`GroupEvent`]s.
#[derive(Debug, Default)]
pub struct GroupRepository {
    groups: RwLock<HashMap<String, GroupSpec>>,
}

impl GroupRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: GroupEvent) {
        match event {
            GroupEvent::Upsert(spec) => {
                tracing::debug!(group = %spec.name, shard_num = spec.shard_num, "group upserted");
                self.groups.write().insert(spec.name.clone(), spec);
            }
            GroupEvent::Delete(name) => {
                if self.groups.write().remove(&name).is_some() {
                    tracing::debug!(group = %name, "group deleted");
                }
            }
        }
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }
}

impl GroupRegistry for GroupRepository {
    fn node_selector(&self, group: &str, stages: &[String]) -> Option<Vec<String>> {
        let groups = self.groups.read();
        let spec = groups.get(group)?;
        let selectors: Vec<String> = spec
            .stages
            .iter()
            .filter(|stage| stages.iter().any(|s| s == &stage.name))
            .map(|stage| stage.node_selector.clone())
            .collect();
        if selectors.is_empty() {
            None
        } else {
            Some(selectors)
        }
    }

    fn shard_num(&self, group: &str) -> Option<u32> {
        self.groups.read().get(group).map(|g| g.shard_num)
    }
}

/// Whether `labels` satisfy every `key=value` term of `selector`.
///
/// An empty selector matches every node. A malformed term matches nothing.
pub fn matches_selector(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).is_some_and(|v| v == value.trim()),
            None => false,
        })
}
