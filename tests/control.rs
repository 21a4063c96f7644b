//! Control registry tests.

mod common;

use common::{registries, GROUP, STREAM};
use liaison::control::groups::{GroupEvent, GroupRegistry, GroupRepository, GroupSpec, StageSpec};
use liaison::control::placement::{NodeInfo, NodeRegistry, NodeTable};
use liaison::control::routing::{hash_entity, EntityResolver, WriteResolver};
use liaison::control::schema::{
    EntityRepository, SchemaCache, SchemaEvent, SchemaId, StreamSchema, TagFamilySpec,
};
use liaison::core::error::LiaisonError;
use liaison::proto::{Metadata, TagFamilyForWrite, TagValue};
use std::sync::Arc;

fn tags(service: &str) -> Vec<TagFamilyForWrite> {
    vec![TagFamilyForWrite {
        tags: vec![TagValue::str(service), TagValue::str("trace")],
    }]
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn same_entity_routes_to_same_shard() {
    let regs = registries(&["n1"]);
    let metadata = Metadata::new(GROUP, STREAM);

    let first = regs.resolver.resolve(&metadata, &tags("svc-a")).unwrap();
    let again = regs.resolver.resolve(&metadata, &tags("svc-a")).unwrap();

    assert_eq!(first, again);
    assert!(first.shard_id < 2);
}

#[test]
fn series_hash_covers_subject_and_entity() {
    let regs = registries(&["n1"]);
    let resolved = regs
        .resolver
        .resolve(&Metadata::new(GROUP, STREAM), &tags("svc-a"))
        .unwrap();

    let expected = hash_entity(&[TagValue::str(STREAM), TagValue::str("svc-a")]);
    assert_eq!(resolved.series_hash, expected.to_be_bytes().to_vec());
    assert_eq!(resolved.shard_id, (expected % 2) as u32);
}

#[test]
fn missing_entity_tag_fails_resolution() {
    let regs = registries(&["n1"]);
    let err = regs
        .resolver
        .resolve(&Metadata::new(GROUP, STREAM), &[])
        .unwrap_err();
    assert!(matches!(err, LiaisonError::Resolve { .. }));
}

#[test]
fn schema_upsert_and_delete_are_visible_to_resolution() {
    let schemas = Arc::new(EntityRepository::new());
    let groups = Arc::new(GroupRepository::new());
    groups.apply(GroupEvent::Upsert(GroupSpec {
        name: "metrics".to_string(),
        shard_num: 4,
        stages: Vec::new(),
    }));
    let resolver = EntityResolver::new(schemas.clone(), groups.clone());
    let metadata = Metadata::new("metrics", "cpu");
    let families = vec![TagFamilyForWrite {
        tags: vec![TagValue::str("host-1")],
    }];

    assert!(resolver.resolve(&metadata, &families).is_err());

    schemas
        .apply(SchemaEvent::Upsert(StreamSchema {
            group: "metrics".to_string(),
            name: "cpu".to_string(),
            mod_revision: 3,
            tag_families: vec![TagFamilySpec {
                name: "default".to_string(),
                tags: vec!["host".to_string()],
            }],
            entity: vec!["host".to_string()],
        }))
        .unwrap();
    let resolved = resolver.resolve(&metadata, &families).unwrap();
    assert!(resolved.shard_id < 4);
    assert_eq!(resolved.entity_values, vec![TagValue::str("host-1")]);
    assert_eq!(
        schemas
            .lookup(&SchemaId::new("metrics", "cpu"))
            .unwrap()
            .mod_revision,
        3
    );

    schemas
        .apply(SchemaEvent::Delete(SchemaId::new("metrics", "cpu")))
        .unwrap();
    assert!(resolver.resolve(&metadata, &families).is_err());
}

// ============================================================================
// Groups
// ============================================================================

#[test]
fn stage_selectors_union_and_absence() {
    let groups = GroupRepository::new();
    groups.apply(GroupEvent::Upsert(GroupSpec {
        name: "sw".to_string(),
        shard_num: 1,
        stages: vec![
            StageSpec {
                name: "warm".to_string(),
                node_selector: "type=warm".to_string(),
            },
            StageSpec {
                name: "cold".to_string(),
                node_selector: "type=cold".to_string(),
            },
        ],
    }));

    let both = groups
        .node_selector("sw", &["warm".to_string(), "cold".to_string()])
        .unwrap();
    assert_eq!(both, vec!["type=warm", "type=cold"]);
    assert_eq!(groups.node_selector("sw", &[]), None);
    assert_eq!(groups.node_selector("unknown", &["warm".to_string()]), None);
    assert_eq!(groups.shard_num("sw"), Some(1));

    groups.apply(GroupEvent::Delete("sw".to_string()));
    assert!(!groups.contains("sw"));
}

// ============================================================================
// Placement
// ============================================================================

#[test]
fn placement_is_stable_and_honours_assignments() {
    let table = NodeTable::new();
    table.register(NodeInfo::new("n1"));
    table.register(NodeInfo::new("n2").with_label("type", "warm"));

    let first = table.locate(GROUP, STREAM, 1).unwrap();
    assert_eq!(table.locate(GROUP, STREAM, 1).unwrap(), first);

    table.assign(GROUP, 1, "n2");
    assert_eq!(table.locate(GROUP, STREAM, 1).unwrap(), "n2");

    table.deregister("n2");
    assert!(matches!(
        table.locate(GROUP, STREAM, 1),
        Err(LiaisonError::NodeUnavailable { .. })
    ));
}

#[test]
fn empty_table_has_no_owner() {
    let table = NodeTable::new();
    assert!(matches!(
        table.locate(GROUP, STREAM, 0),
        Err(LiaisonError::NodeUnavailable { .. })
    ));
}
