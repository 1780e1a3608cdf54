//! In-process provider
//!
//! Shared between every service built from the same registry, which makes it
//! the backend of choice for multi-device simulations and tests. Availability
//! and upload failures can be toggled to exercise fallback and failure paths.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ChangeTransport, StorageProvider};
use crate::error::{KeepsakeError, Result};
use crate::types::{BackupMetadata, BackupPackage, ChangeBatch, StorageInfo};

const DEFAULT_CAPACITY_BYTES: u64 = 1024 * 1024 * 1024;

pub struct MemoryProvider {
    backups: RwLock<HashMap<String, BackupPackage>>,
    /// device id -> sequence -> batch
    batches: RwLock<BTreeMap<String, BTreeMap<u64, ChangeBatch>>>,
    capacity: u64,
    available: AtomicBool,
    fail_writes: AtomicBool,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            backups: RwLock::new(HashMap::new()),
            batches: RwLock::new(BTreeMap::new()),
            capacity,
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every upload and batch send fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Replace a stored package verbatim (used to simulate provider-side corruption)
    pub fn overwrite(&self, package: BackupPackage) {
        self.backups
            .write()
            .insert(package.metadata.id.clone(), package);
    }

    /// Mutable access to a stored batch (used to simulate corruption in transit)
    pub fn tamper_batch<F: FnOnce(&mut ChangeBatch)>(&self, device_id: &str, sequence: u64, f: F) {
        if let Some(batch) = self
            .batches
            .write()
            .get_mut(device_id)
            .and_then(|b| b.get_mut(&sequence))
        {
            f(batch);
        }
    }

    pub fn backup_count(&self) -> usize {
        self.backups.read().len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.read().values().map(BTreeMap::len).sum()
    }

    fn check_writable(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KeepsakeError::Provider("memory provider offline".to_string()));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeepsakeError::Provider("simulated write failure".to_string()));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(KeepsakeError::Provider("memory provider offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn id(&self) -> &str {
        "memory"
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn upload(&self, package: &BackupPackage) -> Result<String> {
        self.check_writable()?;
        let id = package.metadata.id.clone();
        self.backups.write().insert(id.clone(), package.clone());
        Ok(format!("memory://backups/{}", id))
    }

    async fn download(&self, backup_id: &str) -> Result<BackupPackage> {
        self.check_readable()?;
        self.backups
            .read()
            .get(backup_id)
            .cloned()
            .ok_or_else(|| KeepsakeError::NotFound(format!("backup {}", backup_id)))
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        self.check_readable()?;
        let mut result: Vec<BackupMetadata> = self
            .backups
            .read()
            .values()
            .map(|p| p.metadata.clone())
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        self.check_writable()?;
        self.backups
            .write()
            .remove(backup_id)
            .map(|_| ())
            .ok_or_else(|| KeepsakeError::NotFound(format!("backup {}", backup_id)))
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        self.check_readable()?;
        let used: u64 = self
            .backups
            .read()
            .values()
            .map(|p| p.data.len() as u64)
            .sum();
        Ok(StorageInfo {
            total: self.capacity,
            used,
            available: self.capacity.saturating_sub(used),
        })
    }
}

#[async_trait]
impl ChangeTransport for MemoryProvider {
    async fn send_batch(&self, batch: &ChangeBatch) -> Result<()> {
        self.check_writable()?;
        self.batches
            .write()
            .entry(batch.device.id.clone())
            .or_default()
            .insert(batch.sequence, batch.clone());
        Ok(())
    }

    async fn fetch_batches(
        &self,
        cursors: &BTreeMap<String, u64>,
        exclude_device: &str,
    ) -> Result<Vec<ChangeBatch>> {
        self.check_readable()?;
        let batches = self.batches.read();
        let mut result = Vec::new();
        for (device_id, by_sequence) in batches.iter() {
            if device_id == exclude_device {
                continue;
            }
            let cursor = cursors.get(device_id).copied().unwrap_or(0);
            result.extend(
                by_sequence
                    .range(cursor + 1..)
                    .map(|(_, batch)| batch.clone()),
            );
        }
        Ok(result)
    }
}
