//! Change exchange between devices
//!
//! Pending changes leave a device as [`ChangeBatch`]es numbered by a
//! per-device monotonic sequence. Each batch carries a SHA-256 checksum of
//! its serialized changes, verified before anything in it is applied.
//! A receiver keeps one cursor per peer device: the highest sequence it
//! has fully processed. Cursors only move forward, and never past a batch
//! that failed verification.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec;
use crate::error::Result;
use crate::kv::{keys, load_json_or_default, save_json, KeyValueStore};
use crate::types::{ChangeBatch, ChangeRecord, Device};

pub fn batch_checksum(changes: &[ChangeRecord]) -> Result<String> {
    Ok(codec::checksum(&serde_json::to_vec(changes)?))
}

/// Assemble a checksummed batch
pub fn build_batch(device: &Device, sequence: u64, changes: Vec<ChangeRecord>) -> Result<ChangeBatch> {
    let checksum = batch_checksum(&changes)?;
    Ok(ChangeBatch {
        id: uuid::Uuid::new_v4().to_string(),
        device: device.clone(),
        sequence,
        created_at: Utc::now(),
        changes,
        checksum,
    })
}

/// Does the batch content match its checksum
pub fn verify_batch(batch: &ChangeBatch) -> bool {
    match batch_checksum(&batch.changes) {
        Ok(checksum) => checksum == batch.checksum,
        Err(_) => false,
    }
}

#[derive(Default)]
struct CursorState {
    cursors: BTreeMap<String, u64>,
    last_sequence: u64,
}

/// Persisted outbound sequence and inbound cursors
pub struct CursorStore {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<CursorState>,
}

impl CursorStore {
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let cursors = load_json_or_default(kv.as_ref(), keys::PULL_CURSORS)?;
        let last_sequence = load_json_or_default(kv.as_ref(), keys::BATCH_SEQUENCE)?;
        Ok(Self {
            kv,
            state: Mutex::new(CursorState {
                cursors,
                last_sequence,
            }),
        })
    }

    /// Reserve the next outbound sequence number
    pub fn next_sequence(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.last_sequence += 1;
        save_json(self.kv.as_ref(), keys::BATCH_SEQUENCE, &state.last_sequence)?;
        Ok(state.last_sequence)
    }

    pub fn cursors(&self) -> BTreeMap<String, u64> {
        self.state.lock().cursors.clone()
    }

    /// Mark a peer's batch as processed
    pub fn advance(&self, device_id: &str, sequence: u64) -> Result<()> {
        let mut state = self.state.lock();
        let cursor = state.cursors.entry(device_id.to_string()).or_insert(0);
        if sequence <= *cursor {
            return Ok(());
        }
        *cursor = sequence;
        save_json(self.kv.as_ref(), keys::PULL_CURSORS, &state.cursors)
    }
}
