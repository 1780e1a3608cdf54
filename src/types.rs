//! Core types for Keepsake

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{KeepsakeError, Result};

/// Current snapshot format version written into every backup
pub const DATA_VERSION: u32 = 2;

/// Oldest snapshot format this build can still read
pub const MIN_SUPPORTED_DATA_VERSION: u32 = 1;

/// History is capped at this many entries, oldest evicted first
pub const MAX_HISTORY_ENTRIES: usize = 100;

/// Identifier of the only encryption method implemented
pub const ENCRYPTION_AES_256_GCM: &str = "aes-256-gcm";

// ============================================================================
// Backup configuration
// ============================================================================

/// How often automatic backups run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFrequency {
    Hourly,
    #[default]
    Daily,
    Weekly,
    /// No interval; automatic backups never fire
    Manual,
}

impl BackupFrequency {
    /// Timer interval for this frequency, `None` disables the timer
    pub fn interval(&self) -> Option<Duration> {
        match self {
            BackupFrequency::Hourly => Some(Duration::from_secs(60 * 60)),
            BackupFrequency::Daily => Some(Duration::from_secs(24 * 60 * 60)),
            BackupFrequency::Weekly => Some(Duration::from_secs(7 * 24 * 60 * 60)),
            BackupFrequency::Manual => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupFrequency::Hourly => "hourly",
            BackupFrequency::Daily => "daily",
            BackupFrequency::Weekly => "weekly",
            BackupFrequency::Manual => "manual",
        }
    }
}

impl FromStr for BackupFrequency {
    type Err = KeepsakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(BackupFrequency::Hourly),
            "daily" => Ok(BackupFrequency::Daily),
            "weekly" => Ok(BackupFrequency::Weekly),
            "manual" | "never" | "off" => Ok(BackupFrequency::Manual),
            _ => Err(KeepsakeError::InvalidInput(format!(
                "Unknown backup frequency: {}",
                s
            ))),
        }
    }
}

/// Backup configuration, persisted on every change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupConfig {
    /// Master switch for the backup feature
    pub enabled: bool,
    /// Storage provider id (see `storage::ProviderRegistry`)
    pub provider: String,
    /// Run scheduled backups
    pub auto_backup: bool,
    pub backup_frequency: BackupFrequency,
    /// Backups older than this many days are deleted after a successful backup
    pub retention_days: u32,
    pub encryption_enabled: bool,
    pub encryption_method: String,
    pub include_photos: bool,
    pub include_reports: bool,
    pub compress_before_upload: bool,
    #[serde(rename = "maxBackupSizeMB")]
    pub max_backup_size_mb: u64,
    /// Log a warning once provider usage crosses this percentage
    pub warn_at_storage_percent: u8,
    /// Root directory for the local filesystem provider
    pub local_dir: Option<PathBuf>,
    /// Bucket location for the `s3` provider (s3://bucket/prefix)
    pub cloud_uri: Option<String>,
    /// Upper bound for a single provider call
    pub request_timeout_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "local".to_string(),
            auto_backup: false,
            backup_frequency: BackupFrequency::Daily,
            retention_days: 30,
            encryption_enabled: true,
            encryption_method: ENCRYPTION_AES_256_GCM.to_string(),
            include_photos: false,
            include_reports: true,
            compress_before_upload: true,
            max_backup_size_mb: 100,
            warn_at_storage_percent: 80,
            local_dir: None,
            cloud_uri: None,
            request_timeout_secs: 30,
        }
    }
}

impl BackupConfig {
    /// Reject values that would make the pipeline misbehave
    pub fn validate(&self) -> Result<()> {
        if self.provider.trim().is_empty() {
            return Err(KeepsakeError::Config("provider must not be empty".to_string()));
        }
        if self.retention_days == 0 {
            return Err(KeepsakeError::Config(
                "retentionDays must be at least 1".to_string(),
            ));
        }
        if self.warn_at_storage_percent > 100 {
            return Err(KeepsakeError::Config(
                "warnAtStoragePercent must be between 0 and 100".to_string(),
            ));
        }
        if self.max_backup_size_mb == 0 {
            return Err(KeepsakeError::Config(
                "maxBackupSizeMB must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(KeepsakeError::Config(
                "requestTimeoutSecs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_backup_bytes(&self) -> u64 {
        self.max_backup_size_mb * 1024 * 1024
    }
}

// ============================================================================
// Backup data model
// ============================================================================

/// Options handed to the data collection callback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectOptions {
    pub include_photos: bool,
    pub include_reports: bool,
}

/// Full serializable snapshot of app data, grouped by entity type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupData {
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<serde_json::Value>>,
}

impl BackupData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add entities of a type, appending to any already present
    pub fn insert(&mut self, entity_type: impl Into<String>, values: Vec<serde_json::Value>) {
        self.entities
            .entry(entity_type.into())
            .or_default()
            .extend(values);
    }

    pub fn total_entities(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }
}

/// Count and serialized size of one entity type inside a backup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub count: usize,
    pub bytes: usize,
}

/// Metadata describing a stored backup; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub app_version: String,
    pub data_version: u32,
    pub manual: bool,
    pub entities: BTreeMap<String, EntityStats>,
    /// Size of the serialized snapshot before any transform
    pub raw_size: u64,
    /// Size of the stored payload
    pub compressed_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub encryption_method: Option<String>,
    pub key_id: Option<String>,
    pub provider: String,
    /// SHA-256 of exactly the bytes in `BackupPackage::data`
    pub checksum: String,
}

/// The unit moved across the storage boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPackage {
    pub metadata: BackupMetadata,
    /// Base64 of compressed/encrypted bytes, or raw JSON when untransformed
    pub data: String,
    pub signature: String,
}

/// One entry in the append-only backup log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub manual: bool,
    pub success: bool,
    pub size: u64,
    pub provider: String,
    pub error: Option<String>,
}

/// Result of certifying that a package can be restored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupVerification {
    pub valid: bool,
    pub checksum_valid: bool,
    pub signature_valid: bool,
    pub decrypt_valid: bool,
    pub parse_valid: bool,
    pub version_compatible: bool,
    pub errors: Vec<String>,
}

impl BackupVerification {
    /// Recompute `valid` from the individual checks
    pub fn finalize(mut self) -> Self {
        self.valid = self.checksum_valid
            && self.signature_valid
            && self.decrypt_valid
            && self.parse_valid
            && self.version_compatible;
        self
    }
}

/// Outcome of a restore; never thrown, always reported
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub success: bool,
    pub backup_id: String,
    pub restored: BTreeMap<String, usize>,
    /// Entity ids whose local content differed from the backup
    pub conflicts: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Capacity reported by a storage provider, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl StorageInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64 * 100.0
    }
}

/// Summary for status screens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub enabled: bool,
    pub provider: String,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub successful_backups: usize,
    pub failed_backups: usize,
    pub storage: Option<StorageInfo>,
    pub storage_warning: bool,
}

// ============================================================================
// Multi-device sync data model
// ============================================================================

/// A device participating in sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub registered_at: DateTime<Utc>,
    pub active: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            platform: std::env::consts::OS.to_string(),
            registered_at: Utc::now(),
            active: true,
            last_sync_time: None,
        }
    }
}

/// Latest known checksum and version per synchronized entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncManifest {
    pub device_id: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub checksums: BTreeMap<String, String>,
    pub version_vectors: BTreeMap<String, u64>,
    /// When each entity last changed, local or applied remote
    #[serde(default)]
    pub modified_at: BTreeMap<String, DateTime<Utc>>,
    /// Highest version applied per entity from each peer device
    #[serde(default)]
    pub applied_from: BTreeMap<String, BTreeMap<String, u64>>,
}

impl DeviceSyncManifest {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    /// Current version for an entity key, 0 if never seen
    pub fn version(&self, key: &str) -> u64 {
        self.version_vectors.get(key).copied().unwrap_or(0)
    }

    pub fn checksum(&self, key: &str) -> Option<&str> {
        self.checksums.get(key).map(String::as_str)
    }

    pub fn modified(&self, key: &str) -> Option<DateTime<Utc>> {
        self.modified_at.get(key).copied()
    }

    /// Highest version of `key` from `device_id` already applied, 0 if none
    pub fn applied_version(&self, key: &str, device_id: &str) -> u64 {
        self.applied_from
            .get(key)
            .and_then(|devices| devices.get(device_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn note_applied(&mut self, key: &str, device_id: &str, version: u64) {
        let applied = self
            .applied_from
            .entry(key.to_string())
            .or_default()
            .entry(device_id.to_string())
            .or_insert(0);
        *applied = (*applied).max(version);
    }

    /// Record a state whose change happened at `at`
    pub fn record_at(&mut self, key: &str, version: u64, checksum: &str, at: DateTime<Utc>) {
        self.version_vectors.insert(key.to_string(), version);
        self.checksums.insert(key.to_string(), checksum.to_string());
        self.modified_at.insert(key.to_string(), at);
        self.last_updated = Some(Utc::now());
    }
}

/// Manifest key for an entity; ids are only unique within a type
pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}/{}", entity_type, entity_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

/// Changed content carried by a change record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangePayload {
    /// The complete new entity
    Full { data: serde_json::Value },
    /// Top-level fields set and removed relative to the previous state,
    /// plus the resulting entity for peers that hold a different base
    Delta {
        set: serde_json::Map<String, serde_json::Value>,
        removed: Vec<String>,
        snapshot: serde_json::Value,
    },
    Deleted,
}

impl ChangePayload {
    /// Materialize the entity this payload describes on top of `base`
    pub fn apply_to(&self, base: Option<&serde_json::Value>) -> Option<serde_json::Value> {
        match self {
            ChangePayload::Full { data } => Some(data.clone()),
            ChangePayload::Deleted => None,
            ChangePayload::Delta { set, removed, .. } => {
                let mut object = match base {
                    Some(serde_json::Value::Object(map)) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                for key in removed {
                    object.remove(key);
                }
                for (key, value) in set {
                    object.insert(key.clone(), value.clone());
                }
                Some(serde_json::Value::Object(object))
            }
        }
    }

    /// The state a peer ends up with: `apply_to` when it reproduces
    /// `checksum`, otherwise the delta's snapshot
    pub fn materialize(&self, base: Option<&serde_json::Value>, checksum: &str) -> Option<serde_json::Value> {
        let applied = self.apply_to(base);
        match self {
            ChangePayload::Delta { snapshot, .. }
                if crate::codec::state_checksum(applied.as_ref()) != checksum =>
            {
                Some(snapshot.clone())
            }
            _ => applied,
        }
    }
}

/// A single tracked entity mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub payload: ChangePayload,
    pub previous_checksum: Option<String>,
    pub new_checksum: String,
    pub version: u64,
    pub parent_version: u64,
    /// Conflict id when this change commits a conflict resolution
    #[serde(default)]
    pub resolution_of: Option<String>,
}

impl ChangeRecord {
    pub fn entity_key(&self) -> String {
        entity_key(&self.entity_type, &self.entity_id)
    }
}

/// A checksummed group of changes from one device, the unit of change exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub id: String,
    pub device: Device,
    /// Monotonic per sending device
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub changes: Vec<ChangeRecord>,
    /// SHA-256 of the serialized `changes`
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSessionStatus {
    InProgress,
    Completed,
    Failed,
}

/// Record of one push/pull cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub device_id: String,
    pub changes_pushed: usize,
    pub changes_pulled: usize,
    pub conflicts_detected: usize,
    /// Resolution changes published during this session
    pub conflicts_resolved: usize,
    pub bytes_transferred: u64,
    pub status: SyncSessionStatus,
    pub error: Option<String>,
}

impl SyncSession {
    pub fn start(device_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            device_id: device_id.into(),
            changes_pushed: 0,
            changes_pulled: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            bytes_transferred: 0,
            status: SyncSessionStatus::InProgress,
            error: None,
        }
    }
}

/// How a conflict gets resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Adopt one device's version verbatim
    UseDevice,
    /// Per-field last-writer-wins across all versions
    Merge,
    /// Caller supplies the final payload
    Manual,
}

impl FromStr for ResolutionStrategy {
    type Err = KeepsakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "use_device" | "use-device" | "device" => Ok(ResolutionStrategy::UseDevice),
            "merge" => Ok(ResolutionStrategy::Merge),
            "manual" => Ok(ResolutionStrategy::Manual),
            _ => Err(KeepsakeError::InvalidInput(format!(
                "Unknown resolution strategy: {}",
                s
            ))),
        }
    }
}

/// One side of a divergence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictVersion {
    pub device_id: String,
    pub version: u64,
    /// `None` when this side deleted the entity
    pub data: Option<serde_json::Value>,
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable record of two devices advancing the same entity independently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub versions: Vec<ConflictVersion>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<ResolutionStrategy>,
    pub selected_device: Option<String>,
    pub resolved_data: Option<serde_json::Value>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DeviceConflict {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        versions: Vec<ConflictVersion>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            versions,
            detected_at: Utc::now(),
            resolved: false,
            resolution: None,
            selected_device: None,
            resolved_data: None,
            resolved_at: None,
        }
    }

    pub fn entity_key(&self) -> String {
        entity_key(&self.entity_type, &self.entity_id)
    }

    /// Highest version among all divergent sides
    pub fn max_version(&self) -> u64 {
        self.versions.iter().map(|v| v.version).max().unwrap_or(0)
    }
}

/// Runtime tunables for multi-device sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiDeviceSyncConfig {
    pub enabled: bool,
    pub auto_sync: bool,
    /// Zero disables the sync timer
    pub sync_interval_minutes: u64,
    pub max_changes_per_batch: usize,
    pub use_delta_sync: bool,
    pub auto_register_device: bool,
    pub device_name: Option<String>,
    pub max_session_history: usize,
}

impl Default for MultiDeviceSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_sync: false,
            sync_interval_minutes: 15,
            max_changes_per_batch: 100,
            use_delta_sync: false,
            auto_register_device: true,
            device_name: None,
            max_session_history: 50,
        }
    }
}

impl MultiDeviceSyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_changes_per_batch == 0 {
            return Err(KeepsakeError::Config(
                "maxChangesPerBatch must be at least 1".to_string(),
            ));
        }
        if self.max_session_history == 0 {
            return Err(KeepsakeError::Config(
                "maxSessionHistory must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Timer interval, `None` disables periodic sync
    pub fn interval(&self) -> Option<Duration> {
        if self.sync_interval_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.sync_interval_minutes * 60))
        }
    }
}

/// Aggregate counters derived from session history
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub total_sessions: usize,
    pub successful_sessions: usize,
    pub failed_sessions: usize,
    pub changes_pushed: usize,
    pub changes_pulled: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub bytes_transferred: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    pub unresolved_conflicts: usize,
}
