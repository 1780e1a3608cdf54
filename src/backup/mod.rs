//! Backup creation, restore and verification
//!
//! Creation is fail-loud: collect, serialize, compress (falling back to the
//! raw snapshot if compression fails), encrypt, checksum, sign, upload, then
//! record history and apply retention. Any failure before the upload
//! completes records a failed history entry and propagates.
//!
//! Restore is fail-soft: every problem lands in the returned
//! [`RestoreResult`], and local data is only touched after the package has
//! passed [`IntegrityVerifier::verify`].

mod history;
mod integrity;

pub use history::BackupHistory;
pub use integrity::IntegrityVerifier;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::{self, EncryptionKey};
use crate::error::{KeepsakeError, Result};
use crate::kv::{keys, save_json, KeyValueStore};
use crate::source::DataSource;
use crate::storage::{with_timeout, ProviderHandle, ProviderRegistry, SharedProvider};
use crate::types::{
    BackupConfig, BackupData, BackupHistoryEntry, BackupMetadata, BackupPackage, BackupStatus,
    BackupVerification, CollectOptions, EntityStats, RestoreResult, DATA_VERSION,
};

/// Payload compression step of backup creation
pub type Compressor = fn(&[u8]) -> Result<Vec<u8>>;

/// Coordinates the backup pipeline against the active storage provider
pub struct BackupManager {
    kv: Arc<dyn KeyValueStore>,
    source: Arc<dyn DataSource>,
    registry: Arc<ProviderRegistry>,
    provider: SharedProvider,
    config: RwLock<BackupConfig>,
    history: BackupHistory,
    verifier: IntegrityVerifier,
    compress: Compressor,
}

impl BackupManager {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        source: Arc<dyn DataSource>,
        registry: Arc<ProviderRegistry>,
        provider: SharedProvider,
        config: BackupConfig,
    ) -> Result<Self> {
        let history = BackupHistory::load(kv.clone())?;
        Ok(Self {
            kv,
            source,
            registry,
            provider,
            config: RwLock::new(config),
            history,
            verifier: IntegrityVerifier::default(),
            compress: codec::compress,
        })
    }

    /// Replace the zstd compressor used when creating backups
    pub fn with_compressor(mut self, compress: Compressor) -> Self {
        self.compress = compress;
        self
    }

    pub fn config(&self) -> BackupConfig {
        self.config.read().clone()
    }

    /// Validate, persist and apply a new configuration; the provider is
    /// re-resolved when its selection changed
    pub async fn update_config(&self, config: BackupConfig) -> Result<()> {
        config.validate()?;
        save_json(self.kv.as_ref(), keys::BACKUP_CONFIG, &config)?;

        let previous = std::mem::replace(&mut *self.config.write(), config.clone());
        if previous.provider != config.provider
            || previous.local_dir != config.local_dir
            || previous.cloud_uri != config.cloud_uri
        {
            let handle = self.registry.resolve(&config).await?;
            tracing::info!("Storage provider switched to '{}'", handle.id());
            *self.provider.write() = handle;
        }
        Ok(())
    }

    fn provider(&self) -> ProviderHandle {
        self.provider.read().clone()
    }

    fn ensure_enabled(&self) -> Result<BackupConfig> {
        let config = self.config();
        if !config.enabled {
            return Err(KeepsakeError::ConfigDisabled("backup".to_string()));
        }
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Encryption key
    // ------------------------------------------------------------------

    fn load_key(&self) -> Result<Option<EncryptionKey>> {
        match self.kv.get(keys::ENCRYPTION_KEY)? {
            Some(encoded) => Ok(Some(EncryptionKey::from_base64(&encoded)?)),
            None => Ok(None),
        }
    }

    fn load_or_create_key(&self) -> Result<EncryptionKey> {
        if let Some(key) = self.load_key()? {
            return Ok(key);
        }
        let key = EncryptionKey::generate();
        self.kv.set(keys::ENCRYPTION_KEY, &key.to_base64())?;
        tracing::info!("Generated backup encryption key {}", key.id());
        Ok(key)
    }

    /// The backup key as base64, `None` if no encrypted backup was ever made
    pub fn export_key(&self) -> Result<Option<String>> {
        Ok(self.load_key()?.map(|k| k.to_base64()))
    }

    /// Install a key exported from another device; returns its id
    pub fn import_key(&self, encoded: &str) -> Result<String> {
        let key = EncryptionKey::from_base64(encoded)?;
        self.kv.set(keys::ENCRYPTION_KEY, &key.to_base64())?;
        tracing::info!("Imported backup encryption key {}", key.id());
        Ok(key.id().to_string())
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create and upload a backup of everything the data source collects
    pub async fn create_backup(&self, manual: bool) -> Result<BackupMetadata> {
        let config = self.ensure_enabled()?;
        let provider = self.provider();
        let backup_id = uuid::Uuid::new_v4().to_string();

        match self.build_and_upload(&backup_id, manual, &config, &provider).await {
            Ok(metadata) => {
                self.history.append(BackupHistoryEntry {
                    id: metadata.id.clone(),
                    timestamp: metadata.created_at,
                    manual,
                    success: true,
                    size: metadata.compressed_size,
                    provider: metadata.provider.clone(),
                    error: None,
                })?;
                tracing::info!(
                    "Backup {} created ({} entities, {} bytes stored)",
                    metadata.id,
                    metadata.entities.values().map(|s| s.count).sum::<usize>(),
                    metadata.compressed_size
                );

                if let Err(e) = self.cleanup_with(&config, &provider).await {
                    tracing::warn!("Retention cleanup failed: {}", e);
                }
                self.check_storage(&config, &provider).await;

                Ok(metadata)
            }
            Err(e) => {
                tracing::error!("Backup {} failed: {}", backup_id, e);
                if let Err(history_err) = self.history.append(BackupHistoryEntry {
                    id: backup_id,
                    timestamp: Utc::now(),
                    manual,
                    success: false,
                    size: 0,
                    provider: provider.id().to_string(),
                    error: Some(e.to_string()),
                }) {
                    tracing::error!("Failed to record backup failure: {}", history_err);
                }
                Err(e)
            }
        }
    }

    async fn build_and_upload(
        &self,
        backup_id: &str,
        manual: bool,
        config: &BackupConfig,
        provider: &ProviderHandle,
    ) -> Result<BackupMetadata> {
        let data = self
            .source
            .collect(CollectOptions {
                include_photos: config.include_photos,
                include_reports: config.include_reports,
            })
            .await
            .map_err(|e| KeepsakeError::Collection(e.to_string()))?;

        let entities = entity_stats(&data)?;
        let raw = serde_json::to_vec(&data)?;
        let raw_size = raw.len() as u64;

        let mut bytes = raw;
        let mut compressed = false;
        if config.compress_before_upload {
            match (self.compress)(&bytes) {
                Ok(output) => {
                    tracing::debug!("Compressed {} -> {} bytes", raw_size, output.len());
                    bytes = output;
                    compressed = true;
                }
                Err(e) => tracing::warn!("Compression failed, storing uncompressed: {}", e),
            }
        }

        let mut key_id = None;
        let mut encryption_method = None;
        if config.encryption_enabled {
            let key = self.load_or_create_key()?;
            bytes = codec::encrypt(&key, &config.encryption_method, &bytes)?;
            key_id = Some(key.id().to_string());
            encryption_method = Some(config.encryption_method.clone());
        }

        let encrypted = key_id.is_some();
        let payload = if compressed || encrypted {
            codec::encode_base64(&bytes)
        } else {
            String::from_utf8(bytes)
                .map_err(|e| KeepsakeError::Internal(format!("Snapshot is not UTF-8: {}", e)))?
        };

        let stored_size = payload.len() as u64;
        if stored_size > config.max_backup_bytes() {
            return Err(KeepsakeError::InvalidInput(format!(
                "Backup is {} bytes, limit is {} MB",
                stored_size, config.max_backup_size_mb
            )));
        }

        let metadata = BackupMetadata {
            id: backup_id.to_string(),
            created_at: Utc::now(),
            app_version: crate::VERSION.to_string(),
            data_version: DATA_VERSION,
            manual,
            entities,
            raw_size,
            compressed_size: stored_size,
            compressed,
            encrypted,
            encryption_method,
            key_id,
            provider: provider.id().to_string(),
            checksum: codec::checksum(payload.as_bytes()),
        };
        let package = BackupPackage {
            signature: codec::sign(backup_id, payload.as_bytes()),
            metadata,
            data: payload,
        };

        let locator = with_timeout(config.request_timeout(), provider.storage.upload(&package)).await?;
        tracing::debug!("Backup {} stored at {}", backup_id, locator);

        Ok(package.metadata)
    }

    async fn check_storage(&self, config: &BackupConfig, provider: &ProviderHandle) -> bool {
        match with_timeout(config.request_timeout(), provider.storage.storage_info()).await {
            Ok(info) => {
                let percent = info.used_percent();
                let crossed = percent >= config.warn_at_storage_percent as f64;
                if crossed {
                    tracing::warn!(
                        "Backup storage at {:.1}% ({} of {} bytes), threshold {}%",
                        percent,
                        info.used,
                        info.total,
                        config.warn_at_storage_percent
                    );
                }
                crossed
            }
            Err(e) => {
                tracing::debug!("Storage info unavailable: {}", e);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete backups older than the retention window; returns deleted ids
    pub async fn cleanup_old_backups(&self) -> Result<Vec<String>> {
        let config = self.ensure_enabled()?;
        let provider = self.provider();
        self.cleanup_with(&config, &provider).await
    }

    async fn cleanup_with(&self, config: &BackupConfig, provider: &ProviderHandle) -> Result<Vec<String>> {
        let cutoff = Utc::now() - ChronoDuration::days(config.retention_days as i64);
        let backups = with_timeout(config.request_timeout(), provider.storage.list()).await?;

        let mut deleted = Vec::new();
        for metadata in backups.into_iter().filter(|m| m.created_at < cutoff) {
            match with_timeout(config.request_timeout(), provider.storage.delete(&metadata.id)).await {
                Ok(()) => {
                    tracing::info!(
                        "Deleted backup {} from {} (older than {} days)",
                        metadata.id,
                        metadata.created_at,
                        config.retention_days
                    );
                    deleted.push(metadata.id);
                }
                Err(e) => tracing::warn!("Failed to delete expired backup {}: {}", metadata.id, e),
            }
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Restore and verify
    // ------------------------------------------------------------------

    /// Restore a backup into the data source. Only a disabled feature is an
    /// `Err`; everything else is reported in the result.
    pub async fn restore_from_backup(&self, backup_id: &str) -> Result<RestoreResult> {
        let config = self.ensure_enabled()?;
        let provider = self.provider();
        let mut result = RestoreResult {
            backup_id: backup_id.to_string(),
            ..Default::default()
        };

        let package =
            match with_timeout(config.request_timeout(), provider.storage.download(backup_id)).await {
                Ok(package) => package,
                Err(e) => {
                    result.errors.push(format!("Download failed: {}", e));
                    return Ok(finish_restore(result));
                }
            };

        let key = match self.load_key() {
            Ok(key) => key,
            Err(e) => {
                result.errors.push(format!("Encryption key unreadable: {}", e));
                return Ok(finish_restore(result));
            }
        };

        let verification = self.verifier.verify(&package, key.as_ref());
        if !verification.valid {
            tracing::warn!("Backup {} failed verification, nothing restored", backup_id);
            result.errors.extend(verification.errors);
            return Ok(finish_restore(result));
        }

        let data = match self.verifier.decode(&package, key.as_ref()) {
            Ok(data) => data,
            Err(e) => {
                result.errors.push(e.to_string());
                return Ok(finish_restore(result));
            }
        };

        if package.metadata.data_version > self.verifier.current_version() {
            result.warnings.push(format!(
                "Backup data version {} is newer than supported version {}; restoring best effort",
                package.metadata.data_version,
                self.verifier.current_version()
            ));
        }

        for (entity_type, values) in data.entities {
            let expected = package
                .metadata
                .entities
                .get(&entity_type)
                .map(|s| s.count);
            if let Some(expected) = expected {
                if expected != values.len() {
                    result.warnings.push(format!(
                        "{}: metadata lists {} entities, payload has {}",
                        entity_type,
                        expected,
                        values.len()
                    ));
                }
            }

            match self.source.restore_entities(&entity_type, values).await {
                Ok(report) => {
                    result
                        .conflicts
                        .extend(report.conflicts.iter().map(|id| format!("{}/{}", entity_type, id)));
                    result.restored.insert(entity_type, report.applied);
                }
                Err(e) => result
                    .errors
                    .push(format!("Failed to restore {}: {}", entity_type, e)),
            }
        }

        let result = finish_restore(result);
        if result.success {
            tracing::info!(
                "Restored backup {} ({} entities, {} conflicts)",
                backup_id,
                result.restored.values().sum::<usize>(),
                result.conflicts.len()
            );
        } else {
            tracing::error!("Restore of {} finished with {} errors", backup_id, result.errors.len());
        }
        Ok(result)
    }

    /// Certify a package without touching local state
    pub fn verify_backup(&self, package: &BackupPackage) -> BackupVerification {
        let key = match self.load_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Encryption key unreadable: {}", e);
                None
            }
        };
        self.verifier.verify(package, key.as_ref())
    }

    /// Download and verify a stored backup
    pub async fn verify_stored(&self, backup_id: &str) -> Result<BackupVerification> {
        let config = self.ensure_enabled()?;
        let provider = self.provider();
        let package = with_timeout(config.request_timeout(), provider.storage.download(backup_id)).await?;
        Ok(self.verify_backup(&package))
    }

    // ------------------------------------------------------------------
    // Listing and status
    // ------------------------------------------------------------------

    /// Stored backups, newest first
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let config = self.ensure_enabled()?;
        let provider = self.provider();
        with_timeout(config.request_timeout(), provider.storage.list()).await
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let config = self.ensure_enabled()?;
        let provider = self.provider();
        with_timeout(config.request_timeout(), provider.storage.delete(backup_id)).await?;
        tracing::info!("Deleted backup {}", backup_id);
        Ok(())
    }

    /// History entries, oldest first
    pub fn backup_history(&self) -> Vec<BackupHistoryEntry> {
        self.history.entries()
    }

    pub async fn backup_status(&self) -> BackupStatus {
        let config = self.config();
        let provider = self.provider();
        let (successful_backups, failed_backups) = self.history.counts();

        let storage = with_timeout(config.request_timeout(), provider.storage.storage_info())
            .await
            .ok();
        let storage_warning = storage
            .map(|info| info.used_percent() >= config.warn_at_storage_percent as f64)
            .unwrap_or(false);

        BackupStatus {
            enabled: config.enabled,
            provider: provider.id().to_string(),
            last_success: self.history.last_success().map(|e| e.timestamp),
            last_failure: self.history.last_failure().map(|e| e.timestamp),
            successful_backups,
            failed_backups,
            storage,
            storage_warning,
        }
    }
}

fn entity_stats(data: &BackupData) -> Result<BTreeMap<String, EntityStats>> {
    let mut stats = BTreeMap::new();
    for (entity_type, values) in &data.entities {
        stats.insert(
            entity_type.clone(),
            EntityStats {
                count: values.len(),
                bytes: serde_json::to_vec(values)?.len(),
            },
        );
    }
    Ok(stats)
}

fn finish_restore(mut result: RestoreResult) -> RestoreResult {
    result.success = result.errors.is_empty();
    result
}
