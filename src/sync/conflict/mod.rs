//! Conflict detection, storage and resolution
//!
//! Provides:
//! - Classification of incoming changes against the local manifest
//! - A durable store of [`DeviceConflict`]s
//! - Per-field last-writer-wins merge
//! - Resolution strategies (use device, merge, manual)

mod detector;
mod merge;
mod resolver;

pub use detector::{classify, Disposition};
pub use merge::FieldMerge;
pub use resolver::{ConflictResolver, Resolution};

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{KeepsakeError, Result};
use crate::kv::{keys, load_json_or_default, save_json, KeyValueStore};
use crate::types::{ConflictVersion, DeviceConflict};

/// Persisted conflicts. Conflicts leave the unresolved set only by being
/// marked resolved; nothing here deletes them.
pub struct ConflictStore {
    kv: Arc<dyn KeyValueStore>,
    conflicts: Mutex<Vec<DeviceConflict>>,
}

impl ConflictStore {
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let conflicts = load_json_or_default(kv.as_ref(), keys::CONFLICTS)?;
        Ok(Self {
            kv,
            conflicts: Mutex::new(conflicts),
        })
    }

    /// All conflicts, or only the open ones, in detection order
    pub fn list(&self, unresolved_only: bool) -> Vec<DeviceConflict> {
        self.conflicts
            .lock()
            .iter()
            .filter(|c| !unresolved_only || !c.resolved)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<DeviceConflict> {
        self.conflicts
            .lock()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| KeepsakeError::ConflictNotFound(id.to_string()))
    }

    /// The open conflict for an entity key, if any
    pub fn open_for(&self, entity_key: &str) -> Option<DeviceConflict> {
        self.conflicts
            .lock()
            .iter()
            .find(|c| !c.resolved && c.entity_key() == entity_key)
            .cloned()
    }

    pub fn unresolved_count(&self) -> usize {
        self.conflicts.lock().iter().filter(|c| !c.resolved).count()
    }

    pub fn insert(&self, conflict: DeviceConflict) -> Result<()> {
        let mut conflicts = self.conflicts.lock();
        conflicts.push(conflict);
        save_json(self.kv.as_ref(), keys::CONFLICTS, &*conflicts)
    }

    /// Add a further divergent version to an open conflict. A newer version
    /// from a device replaces that device's older one.
    pub fn append_version(&self, conflict_id: &str, version: ConflictVersion) -> Result<()> {
        let mut conflicts = self.conflicts.lock();
        let conflict = conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| KeepsakeError::ConflictNotFound(conflict_id.to_string()))?;

        match conflict
            .versions
            .iter_mut()
            .find(|v| v.device_id == version.device_id)
        {
            Some(existing) if existing.version >= version.version => return Ok(()),
            Some(existing) => *existing = version,
            None => conflict.versions.push(version),
        }
        save_json(self.kv.as_ref(), keys::CONFLICTS, &*conflicts)
    }

    /// Stamp the resolution onto a conflict
    pub fn mark_resolved(&self, conflict_id: &str, resolution: &Resolution) -> Result<DeviceConflict> {
        let mut conflicts = self.conflicts.lock();
        let conflict = conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| KeepsakeError::ConflictNotFound(conflict_id.to_string()))?;

        conflict.resolved = true;
        conflict.resolution = Some(resolution.strategy);
        conflict.selected_device = resolution.selected_device.clone();
        conflict.resolved_data = resolution.data.clone();
        conflict.resolved_at = Some(Utc::now());
        let resolved = conflict.clone();

        save_json(self.kv.as_ref(), keys::CONFLICTS, &*conflicts)?;
        Ok(resolved)
    }
}
