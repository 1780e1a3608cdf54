//! Append-only backup history, capped at `MAX_HISTORY_ENTRIES`

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::Result;
use crate::kv::{keys, load_json_or_default, save_json, KeyValueStore};
use crate::types::{BackupHistoryEntry, MAX_HISTORY_ENTRIES};

pub struct BackupHistory {
    kv: Arc<dyn KeyValueStore>,
    entries: Mutex<Vec<BackupHistoryEntry>>,
}

impl BackupHistory {
    /// Load persisted history
    pub fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let entries: Vec<BackupHistoryEntry> =
            load_json_or_default(kv.as_ref(), keys::BACKUP_HISTORY)?;
        Ok(Self {
            kv,
            entries: Mutex::new(entries),
        })
    }

    /// Append an entry, evicting the oldest beyond the cap, and persist
    pub fn append(&self, entry: BackupHistoryEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.push(entry);
        if entries.len() > MAX_HISTORY_ENTRIES {
            let excess = entries.len() - MAX_HISTORY_ENTRIES;
            entries.drain(..excess);
        }
        save_json(self.kv.as_ref(), keys::BACKUP_HISTORY, &*entries)
    }

    /// Entries oldest first
    pub fn entries(&self) -> Vec<BackupHistoryEntry> {
        self.entries.lock().clone()
    }

    pub fn last_success(&self) -> Option<BackupHistoryEntry> {
        self.entries.lock().iter().rev().find(|e| e.success).cloned()
    }

    pub fn last_failure(&self) -> Option<BackupHistoryEntry> {
        self.entries.lock().iter().rev().find(|e| !e.success).cloned()
    }

    /// (successful, failed) counts
    pub fn counts(&self) -> (usize, usize) {
        let entries = self.entries.lock();
        let ok = entries.iter().filter(|e| e.success).count();
        (ok, entries.len() - ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use chrono::Utc;

    fn entry(id: usize, success: bool) -> BackupHistoryEntry {
        BackupHistoryEntry {
            id: format!("b{}", id),
            timestamp: Utc::now(),
            manual: false,
            success,
            size: 10,
            provider: "memory".to_string(),
            error: if success { None } else { Some("boom".to_string()) },
        }
    }

    #[test]
    fn test_history_caps_and_evicts_oldest() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let history = BackupHistory::load(kv.clone()).unwrap();

        for i in 0..(MAX_HISTORY_ENTRIES + 5) {
            history.append(entry(i, true)).unwrap();
        }

        let entries = history.entries();
        assert_eq!(entries.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(entries[0].id, "b5");

        let reloaded = BackupHistory::load(kv).unwrap();
        assert_eq!(reloaded.entries().len(), MAX_HISTORY_ENTRIES);
    }

    #[test]
    fn test_last_success_and_failure() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let history = BackupHistory::load(kv).unwrap();
        history.append(entry(1, true)).unwrap();
        history.append(entry(2, false)).unwrap();
        history.append(entry(3, true)).unwrap();

        assert_eq!(history.last_success().unwrap().id, "b3");
        assert_eq!(history.last_failure().unwrap().id, "b2");
        assert_eq!(history.counts(), (2, 1));
    }
}
