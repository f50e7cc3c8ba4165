//! Identity-keyed mappings
//!
//! Two independent maps keyed by server id: a per-server snapshot override
//! and a DNS record name. Keys are normalized to the canonical decimal
//! string on every write; reads tolerate ids that older state recorded as
//! numbers or padded strings. After a successful recreation the old key is
//! removed and the new key carries the same value, so no duplicates survive.

use crate::models::{ResourceId, SnapshotId};
use crate::store::StateStore;
use anyhow::Result;
use serde_json::{json, Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

const SNAPSHOT_MAP: &str = "snapshot_map";
const RECORD_MAP: &str = "record_map";

/// What a migration actually moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub snapshot_moved: bool,
    pub record_moved: bool,
}

/// Store-backed registry for the snapshot-override and DNS-record maps.
pub struct MappingRegistry {
    store: Arc<dyn StateStore>,
}

impl MappingRegistry {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Explicit snapshot override for a server, if any. Values recorded as
    /// numbers or strings both parse.
    pub fn snapshot_override(&self, id: ResourceId) -> Option<SnapshotId> {
        let value = lookup(&self.map(SNAPSHOT_MAP), id)?;
        parse_snapshot_id(&value)
    }

    /// DNS record name mapped to a server, if any.
    pub fn record_name(&self, id: ResourceId) -> Option<String> {
        lookup(&self.map(RECORD_MAP), id).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_snapshot_override(&self, id: ResourceId, snapshot: SnapshotId) -> Result<()> {
        self.store.update(&mut |doc| {
            entry(doc, SNAPSHOT_MAP).insert(id.key(), json!(snapshot.0));
        })
    }

    pub fn set_record_name(&self, id: ResourceId, name: &str) -> Result<()> {
        self.store.update(&mut |doc| {
            entry(doc, RECORD_MAP).insert(id.key(), json!(name));
        })
    }

    /// Move both maps from a destroyed server's id to its replacement.
    ///
    /// Pure overwrite + delete: re-running after a crash neither duplicates
    /// nor corrupts entries, and a no-op when the old key is absent.
    pub fn migrate(&self, old: ResourceId, new: ResourceId) -> Result<MigrationOutcome> {
        let mut outcome = MigrationOutcome::default();
        self.store.update(&mut |doc| {
            outcome.snapshot_moved = migrate_key(entry(doc, SNAPSHOT_MAP), old, new);
            outcome.record_moved = migrate_key(entry(doc, RECORD_MAP), old, new);
        })?;

        if outcome.snapshot_moved || outcome.record_moved {
            debug!(old_id = %old, new_id = %new, ?outcome, "Migrated identity mappings");
        }
        Ok(outcome)
    }

    /// Load initial mappings from configuration without clobbering state a
    /// previous run already migrated.
    pub fn seed_if_empty(
        &self,
        snapshots: &[(ResourceId, SnapshotId)],
        records: &[(ResourceId, String)],
    ) -> Result<()> {
        self.store.update(&mut |doc| {
            let map = entry(doc, SNAPSHOT_MAP);
            if map.is_empty() {
                for (id, snapshot) in snapshots {
                    map.insert(id.key(), json!(snapshot.0));
                }
            }
            let map = entry(doc, RECORD_MAP);
            if map.is_empty() {
                for (id, name) in records {
                    map.insert(id.key(), json!(name));
                }
            }
        })
    }

    fn map(&self, key: &str) -> Map<String, Value> {
        match self.store.get(key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn entry<'a>(doc: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    if !matches!(doc.get(key), Some(Value::Object(_))) {
        doc.insert(key.to_string(), Value::Object(Map::new()));
    }
    doc.get_mut(key).and_then(Value::as_object_mut).unwrap()
}

/// Find a value keyed by `id` regardless of how the key was written.
fn lookup(map: &Map<String, Value>, id: ResourceId) -> Option<Value> {
    if let Some(value) = map.get(&id.key()) {
        return Some(value.clone());
    }
    map.iter()
        .find(|(key, _)| ResourceId::from_str(key) == Ok(id))
        .map(|(_, value)| value.clone())
}

/// Copy the value under `old` (in any key form) to the canonical key for
/// `new`, removing every key that parses to `old`.
fn migrate_key(map: &mut Map<String, Value>, old: ResourceId, new: ResourceId) -> bool {
    let value = match lookup(map, old) {
        Some(v) => v,
        None => return false,
    };
    map.retain(|key, _| ResourceId::from_str(key) != Ok(old));
    map.insert(new.key(), value);
    true
}

fn parse_snapshot_id(value: &Value) -> Option<SnapshotId> {
    match value {
        Value::Number(n) => n.as_u64().map(SnapshotId),
        Value::String(s) => SnapshotId::from_str(s).ok(),
        _ => None,
    }
}
