//! Local change tracking
//!
//! Every local mutation becomes a [`ChangeRecord`] on the pending queue and
//! advances the entity's entry in the device manifest. Versions are per
//! entity and strictly increasing: a change always carries
//! `version == parent_version + 1` where `parent_version` is the manifest
//! version it was built on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::codec;
use crate::error::{KeepsakeError, Result};
use crate::kv::{keys, load_json, load_json_or_default, save_json, KeyValueStore};
use crate::types::{entity_key, ChangeOperation, ChangePayload, ChangeRecord, DeviceSyncManifest};

/// A local change to be recorded
#[derive(Debug, Clone, Copy)]
pub struct LocalChange<'a> {
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub operation: ChangeOperation,
    /// New state; `None` only for deletes
    pub data: Option<&'a Value>,
    /// State before the change, when the caller knows it
    pub previous: Option<&'a Value>,
}

struct TrackerState {
    manifest: DeviceSyncManifest,
    pending: Vec<ChangeRecord>,
}

/// Owner of the device manifest and the pending-change queue
pub struct ChangeTracker {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<TrackerState>,
}

impl ChangeTracker {
    /// Load manifest and pending queue from the key-value store
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let manifest = load_json(kv.as_ref(), keys::DEVICE_MANIFEST)?
            .unwrap_or_else(|| DeviceSyncManifest::new(""));
        let pending: Vec<ChangeRecord> = load_json_or_default(kv.as_ref(), keys::PENDING_CHANGES)?;
        Ok(Self {
            kv,
            state: Mutex::new(TrackerState { manifest, pending }),
        })
    }

    /// Bind the manifest to the registered device
    pub fn set_device(&self, device_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.manifest.device_id != device_id {
            state.manifest.device_id = device_id.to_string();
            save_json(self.kv.as_ref(), keys::DEVICE_MANIFEST, &state.manifest)?;
        }
        Ok(())
    }

    /// Record a local mutation and queue it for push
    pub fn record_change(
        &self,
        device_id: &str,
        change: LocalChange<'_>,
        use_delta: bool,
    ) -> Result<ChangeRecord> {
        if change.entity_type.is_empty() || change.entity_id.is_empty() {
            return Err(KeepsakeError::InvalidInput(
                "entity type and id are required".to_string(),
            ));
        }

        let (payload, new_checksum) = match (change.operation, change.data) {
            (ChangeOperation::Delete, _) => (ChangePayload::Deleted, codec::tombstone_checksum()),
            (_, Some(data)) => {
                let payload = match change.previous {
                    Some(previous) if use_delta => field_delta(previous, data)
                        .unwrap_or_else(|| ChangePayload::Full { data: data.clone() }),
                    _ => ChangePayload::Full { data: data.clone() },
                };
                (payload, codec::checksum_value(data))
            }
            (operation, None) => {
                return Err(KeepsakeError::InvalidInput(format!(
                    "{:?} of {}/{} requires data",
                    operation, change.entity_type, change.entity_id
                )))
            }
        };

        let key = entity_key(change.entity_type, change.entity_id);
        let mut state = self.state.lock();

        let parent_version = state.manifest.version(&key);
        let previous_checksum = change
            .previous
            .map(codec::checksum_value)
            .or_else(|| state.manifest.checksum(&key).map(str::to_string));

        let record = ChangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.to_string(),
            entity_type: change.entity_type.to_string(),
            entity_id: change.entity_id.to_string(),
            operation: change.operation,
            payload,
            previous_checksum,
            new_checksum,
            version: parent_version + 1,
            parent_version,
            resolution_of: None,
        };

        state.pending.push(record.clone());
        state
            .manifest
            .record_at(&key, record.version, &record.new_checksum, record.timestamp);
        self.persist(&state)?;

        tracing::debug!(
            "Recorded {:?} of {} at version {}",
            record.operation,
            key,
            record.version
        );
        Ok(record)
    }

    /// Queue the committed result of a conflict resolution. The new version
    /// is one past `max_version`, the highest version among the sides.
    pub fn record_resolution(
        &self,
        device_id: &str,
        entity_type: &str,
        entity_id: &str,
        data: Option<&Value>,
        max_version: u64,
        conflict_id: &str,
    ) -> Result<ChangeRecord> {
        let key = entity_key(entity_type, entity_id);
        let mut state = self.state.lock();

        let parent_version = max_version.max(state.manifest.version(&key));
        let (operation, payload, new_checksum) = match data {
            Some(data) => (
                ChangeOperation::Update,
                ChangePayload::Full { data: data.clone() },
                codec::checksum_value(data),
            ),
            None => (
                ChangeOperation::Delete,
                ChangePayload::Deleted,
                codec::tombstone_checksum(),
            ),
        };

        let record = ChangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            device_id: device_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation,
            payload,
            previous_checksum: state.manifest.checksum(&key).map(str::to_string),
            new_checksum,
            version: parent_version + 1,
            parent_version,
            resolution_of: Some(conflict_id.to_string()),
        };

        state.pending.push(record.clone());
        state
            .manifest
            .record_at(&key, record.version, &record.new_checksum, record.timestamp);
        self.persist(&state)?;
        Ok(record)
    }

    /// Record a remote state applied locally (or found already present)
    pub fn observe(&self, key: &str, version: u64, checksum: &str, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        let version = version.max(state.manifest.version(key));
        state.manifest.record_at(key, version, checksum, at);
        save_json(self.kv.as_ref(), keys::DEVICE_MANIFEST, &state.manifest)
    }

    /// Highest version of `key` from `device_id` applied so far
    pub fn applied_version(&self, key: &str, device_id: &str) -> u64 {
        self.state.lock().manifest.applied_version(key, device_id)
    }

    /// Remember that `device_id`'s change at `version` has been handled
    pub fn note_applied(&self, key: &str, device_id: &str, version: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.manifest.note_applied(key, device_id, version);
        save_json(self.kv.as_ref(), keys::DEVICE_MANIFEST, &state.manifest)
    }

    /// Drop pushed changes from the queue; changes recorded since the push
    /// started stay queued
    pub fn acknowledge(&self, pushed: &HashSet<String>) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.retain(|c| !pushed.contains(&c.id));
        save_json(self.kv.as_ref(), keys::PENDING_CHANGES, &state.pending)
    }

    pub fn pending(&self) -> Vec<ChangeRecord> {
        self.state.lock().pending.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn manifest(&self) -> DeviceSyncManifest {
        self.state.lock().manifest.clone()
    }

    pub fn version(&self, key: &str) -> u64 {
        self.state.lock().manifest.version(key)
    }

    pub fn checksum(&self, key: &str) -> Option<String> {
        self.state.lock().manifest.checksum(key).map(str::to_string)
    }

    pub fn modified(&self, key: &str) -> Option<DateTime<Utc>> {
        self.state.lock().manifest.modified(key)
    }

    fn persist(&self, state: &TrackerState) -> Result<()> {
        save_json(self.kv.as_ref(), keys::PENDING_CHANGES, &state.pending)?;
        save_json(self.kv.as_ref(), keys::DEVICE_MANIFEST, &state.manifest)
    }
}

/// Top-level field delta between two objects, `None` if either is not one
fn field_delta(previous: &Value, current: &Value) -> Option<ChangePayload> {
    let (Value::Object(before), Value::Object(after)) = (previous, current) else {
        return None;
    };

    let mut set = Map::new();
    for (field, value) in after {
        if before.get(field) != Some(value) {
            set.insert(field.clone(), value.clone());
        }
    }
    let removed = before
        .keys()
        .filter(|field| !after.contains_key(*field))
        .cloned()
        .collect();

    Some(ChangePayload::Delta {
        set,
        removed,
        snapshot: current.clone(),
    })
}
