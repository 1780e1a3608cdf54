//! Sync sessions: push pending changes, then pull and apply peers' changes
//!
//! Only one session runs at a time. A second `sync()` while one is running
//! fails with [`KeepsakeError::SyncInProgress`] instead of queueing, and the
//! flag is released by a drop guard whatever the outcome. Divergent remote
//! changes become durable [`DeviceConflict`]s and are never applied or
//! resolved by a session; resolution is always an explicit call.
//!
//! Local writes, applied remote changes and committed resolutions all take
//! the same entity lock, so the data source and the manifest never disagree
//! about an entity's current state.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::conflict::{classify, ConflictResolver, ConflictStore, Disposition};
use super::tracker::{ChangeTracker, LocalChange};
use super::transport::{self, CursorStore};
use crate::codec;
use crate::error::{KeepsakeError, Result};
use crate::kv::{keys, load_json, load_json_or_default, save_json, KeyValueStore};
use crate::source::DataSource;
use crate::storage::{with_timeout, SharedProvider};
use crate::types::{
    ChangeBatch, ChangeOperation, ChangeRecord, ConflictVersion, Device, DeviceConflict,
    MultiDeviceSyncConfig, ResolutionStrategy, SyncSession, SyncSessionStatus, SyncStatistics,
};

const DEFAULT_DEVICE_NAME: &str = "This device";

/// Clears the in-progress flag when the session ends, however it ends
struct SessionGuard<'a>(&'a AtomicBool);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncCoordinator {
    kv: Arc<dyn KeyValueStore>,
    source: Arc<dyn DataSource>,
    provider: SharedProvider,
    config: RwLock<MultiDeviceSyncConfig>,
    request_timeout: RwLock<Duration>,
    device: RwLock<Option<Device>>,
    known_devices: RwLock<BTreeMap<String, Device>>,
    tracker: ChangeTracker,
    conflicts: ConflictStore,
    resolver: ConflictResolver,
    cursors: CursorStore,
    sessions: Mutex<Vec<SyncSession>>,
    in_progress: AtomicBool,
    entity_lock: tokio::sync::Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        source: Arc<dyn DataSource>,
        provider: SharedProvider,
        config: MultiDeviceSyncConfig,
        request_timeout: Duration,
    ) -> Result<Self> {
        let device: Option<Device> = load_json(kv.as_ref(), keys::CURRENT_DEVICE)?;
        let tracker = ChangeTracker::load(kv.clone())?;
        if let Some(device) = &device {
            tracker.set_device(&device.id)?;
        }

        Ok(Self {
            known_devices: RwLock::new(load_json_or_default(kv.as_ref(), keys::KNOWN_DEVICES)?),
            sessions: Mutex::new(load_json_or_default(kv.as_ref(), keys::SYNC_SESSIONS)?),
            conflicts: ConflictStore::load(kv.clone())?,
            cursors: CursorStore::load(kv.clone())?,
            resolver: ConflictResolver::new(),
            config: RwLock::new(config),
            request_timeout: RwLock::new(request_timeout),
            device: RwLock::new(device),
            in_progress: AtomicBool::new(false),
            entity_lock: tokio::sync::Mutex::new(()),
            tracker,
            kv,
            source,
            provider,
        })
    }

    pub fn config(&self) -> MultiDeviceSyncConfig {
        self.config.read().clone()
    }

    /// Validate, persist and apply a new configuration
    pub fn update_config(&self, config: MultiDeviceSyncConfig) -> Result<()> {
        config.validate()?;
        save_json(self.kv.as_ref(), keys::SYNC_CONFIG, &config)?;
        *self.config.write() = config;
        Ok(())
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.write() = timeout;
    }

    fn timeout(&self) -> Duration {
        *self.request_timeout.read()
    }

    fn ensure_enabled(&self) -> Result<MultiDeviceSyncConfig> {
        let config = self.config();
        if !config.enabled {
            return Err(KeepsakeError::ConfigDisabled("multi-device sync".to_string()));
        }
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Register this installation; returns the existing device if there is one
    pub fn register_device(&self, name: Option<&str>) -> Result<Device> {
        if let Some(device) = self.current_device() {
            return Ok(device);
        }

        let name = name
            .map(str::to_string)
            .or_else(|| self.config().device_name)
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());
        let device = Device::new(name);

        save_json(self.kv.as_ref(), keys::CURRENT_DEVICE, &device)?;
        self.tracker.set_device(&device.id)?;
        *self.device.write() = Some(device.clone());

        tracing::info!("Registered device {} ({})", device.name, device.id);
        Ok(device)
    }

    pub fn current_device(&self) -> Option<Device> {
        self.device.read().clone()
    }

    pub fn rename_device(&self, name: &str) -> Result<Device> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KeepsakeError::InvalidInput("device name must not be empty".to_string()));
        }
        let mut guard = self.device.write();
        let device = guard.as_mut().ok_or(KeepsakeError::DeviceNotRegistered)?;
        device.name = name.to_string();
        save_json(self.kv.as_ref(), keys::CURRENT_DEVICE, &*device)?;
        Ok(device.clone())
    }

    /// Peers seen in pulled batches, with the latest details they published
    pub fn known_devices(&self) -> Vec<Device> {
        self.known_devices.read().values().cloned().collect()
    }

    fn note_device(&self, device: &Device) -> Result<()> {
        let mut known = self.known_devices.write();
        if known.get(&device.id) == Some(device) {
            return Ok(());
        }
        known.insert(device.id.clone(), device.clone());
        save_json(self.kv.as_ref(), keys::KNOWN_DEVICES, &*known)
    }

    // ------------------------------------------------------------------
    // Local changes
    // ------------------------------------------------------------------

    /// Write a local mutation to the data source and record it. With
    /// auto-sync on and no session running, a sync is started in the
    /// background; the caller does not wait for it.
    pub async fn record_change(
        self: &Arc<Self>,
        entity_type: &str,
        entity_id: &str,
        operation: ChangeOperation,
        data: Option<&Value>,
        previous: Option<&Value>,
    ) -> Result<ChangeRecord> {
        let config = self.ensure_enabled()?;
        let device = self.current_device().ok_or(KeepsakeError::DeviceNotRegistered)?;
        if entity_type.is_empty() || entity_id.is_empty() {
            return Err(KeepsakeError::InvalidInput(
                "entity type and id are required".to_string(),
            ));
        }
        let state = match operation {
            ChangeOperation::Delete => None,
            _ => Some(data.cloned().ok_or_else(|| {
                KeepsakeError::InvalidInput(format!(
                    "{:?} of {}/{} requires data",
                    operation, entity_type, entity_id
                ))
            })?),
        };

        let record = {
            let _entity = self.entity_lock.lock().await;
            self.source.put_entity(entity_type, entity_id, state).await?;
            self.tracker.record_change(
                &device.id,
                LocalChange {
                    entity_type,
                    entity_id,
                    operation,
                    data,
                    previous,
                },
                config.use_delta_sync,
            )?
        };

        if config.auto_sync && !self.is_syncing() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let coordinator = Arc::clone(self);
                handle.spawn(async move {
                    match coordinator.sync().await {
                        Ok(_) | Err(KeepsakeError::SyncInProgress) => {}
                        Err(e) => tracing::warn!("Auto-sync failed to start: {}", e),
                    }
                });
            }
        }

        Ok(record)
    }

    pub fn pending_changes(&self) -> Vec<ChangeRecord> {
        self.tracker.pending()
    }

    pub fn manifest(&self) -> crate::types::DeviceSyncManifest {
        self.tracker.manifest()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Run one push-then-pull session. Only the reentrancy guard and the
    /// preconditions are errors; failures during the session are reported
    /// in the returned session's status.
    pub async fn sync(&self) -> Result<SyncSession> {
        let config = self.ensure_enabled()?;
        let device = self.current_device().ok_or(KeepsakeError::DeviceNotRegistered)?;

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(KeepsakeError::SyncInProgress);
        }
        let _guard = SessionGuard(&self.in_progress);

        let mut session = SyncSession::start(&device.id);
        tracing::debug!("Sync session {} started", session.id);

        let outcome = match self.push(&device, &config, &mut session).await {
            Ok(()) => self.pull(&device, &mut session).await,
            Err(e) => Err(e),
        };

        session.ended_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                session.status = SyncSessionStatus::Completed;
                if let Err(e) = self.touch_last_sync(session.ended_at) {
                    tracing::warn!("Failed to persist last sync time: {}", e);
                }
                tracing::info!(
                    "Sync session {} completed: {} pushed, {} pulled, {} conflicts",
                    session.id,
                    session.changes_pushed,
                    session.changes_pulled,
                    session.conflicts_detected
                );
            }
            Err(e) => {
                session.status = SyncSessionStatus::Failed;
                session.error = Some(e.to_string());
                tracing::error!("Sync session {} failed: {}", session.id, e);
            }
        }

        if let Err(e) = self.save_session(&session, config.max_session_history) {
            tracing::warn!("Failed to persist sync session: {}", e);
        }
        Ok(session)
    }

    async fn push(
        &self,
        device: &Device,
        config: &MultiDeviceSyncConfig,
        session: &mut SyncSession,
    ) -> Result<()> {
        let pending = self.tracker.pending();
        if pending.is_empty() {
            return Ok(());
        }

        let transport = self.provider.read().transport.clone();
        for chunk in pending.chunks(config.max_changes_per_batch) {
            let sequence = self.cursors.next_sequence()?;
            let batch = transport::build_batch(device, sequence, chunk.to_vec())?;
            let size = serde_json::to_vec(&batch)?.len() as u64;

            with_timeout(self.timeout(), transport.send_batch(&batch)).await?;

            session.changes_pushed += chunk.len();
            session.conflicts_resolved += chunk.iter().filter(|c| c.resolution_of.is_some()).count();
            session.bytes_transferred += size;
            tracing::debug!("Pushed batch {} ({} changes)", sequence, chunk.len());
        }

        // Every batch is confirmed; drop exactly what was sent
        let pushed: HashSet<String> = pending.into_iter().map(|c| c.id).collect();
        self.tracker.acknowledge(&pushed)
    }

    async fn pull(&self, device: &Device, session: &mut SyncSession) -> Result<()> {
        let transport = self.provider.read().transport.clone();
        let cursors = self.cursors.cursors();
        let batches = with_timeout(self.timeout(), transport.fetch_batches(&cursors, &device.id)).await?;

        let mut blocked: HashSet<String> = HashSet::new();
        for batch in batches {
            if blocked.contains(&batch.device.id) {
                continue;
            }
            if !transport::verify_batch(&batch) {
                tracing::warn!(
                    "Skipping corrupted change batch {} from device {} (sequence {})",
                    batch.id,
                    batch.device.id,
                    batch.sequence
                );
                blocked.insert(batch.device.id.clone());
                continue;
            }

            self.apply_batch(device, &batch, session).await?;
            self.cursors.advance(&batch.device.id, batch.sequence)?;
        }
        Ok(())
    }

    async fn apply_batch(&self, device: &Device, batch: &ChangeBatch, session: &mut SyncSession) -> Result<()> {
        self.note_device(&batch.device)?;
        session.bytes_transferred += serde_json::to_vec(batch)?.len() as u64;

        for change in &batch.changes {
            if change.device_id == device.id {
                continue;
            }
            if self.apply_incoming(device, change, session).await? {
                session.changes_pulled += 1;
            }
        }
        tracing::debug!(
            "Pulled batch {} from {} ({} changes)",
            batch.sequence,
            batch.device.id,
            batch.changes.len()
        );
        Ok(())
    }

    /// Apply one peer change; `false` when it was skipped without effect
    async fn apply_incoming(&self, device: &Device, change: &ChangeRecord, session: &mut SyncSession) -> Result<bool> {
        let key = change.entity_key();
        let _entity = self.entity_lock.lock().await;

        // Re-sent after a push that failed midway
        if change.version <= self.tracker.applied_version(&key, &change.device_id) {
            tracing::debug!(
                "Skipping replayed version {} of {} from {}",
                change.version,
                key,
                change.device_id
            );
            return Ok(false);
        }

        let local = self
            .source
            .get_entity(&change.entity_type, &change.entity_id)
            .await?;
        let remote = change.payload.materialize(local.as_ref(), &change.new_checksum);
        if codec::state_checksum(remote.as_ref()) != change.new_checksum {
            tracing::warn!(
                "Skipping version {} of {} from {}: payload does not match its checksum",
                change.version,
                key,
                change.device_id
            );
            return Ok(false);
        }

        if let Some(open) = self.conflicts.open_for(&key) {
            tracing::debug!("Adding version {} of {} to open conflict {}", change.version, key, open.id);
            self.conflicts.append_version(&open.id, remote_version(change, remote))?;
            self.tracker.note_applied(&key, &change.device_id, change.version)?;
            return Ok(true);
        }

        let local_version = self.tracker.version(&key);
        let local_checksum = self.tracker.checksum(&key);

        match classify(change, local_version, local_checksum.as_deref()) {
            Disposition::AlreadyApplied => {
                self.tracker
                    .observe(&key, change.version, &change.new_checksum, change.timestamp)?;
            }
            Disposition::FastForward => {
                self.source
                    .put_entity(&change.entity_type, &change.entity_id, remote)
                    .await?;
                let version = change.version.max(local_version + 1);
                self.tracker
                    .observe(&key, version, &change.new_checksum, change.timestamp)?;
            }
            Disposition::Diverged => {
                let mine = ConflictVersion {
                    device_id: device.id.clone(),
                    version: local_version,
                    data: local.clone(),
                    checksum: local_checksum.unwrap_or_default(),
                    timestamp: self.tracker.modified(&key).unwrap_or_else(Utc::now),
                };
                let conflict = DeviceConflict::new(
                    &change.entity_type,
                    &change.entity_id,
                    vec![mine, remote_version(change, remote)],
                );
                tracing::info!(
                    "Conflict {} on {}: local version {} vs {} version {}",
                    conflict.id,
                    key,
                    local_version,
                    change.device_id,
                    change.version
                );
                self.conflicts.insert(conflict)?;
                session.conflicts_detected += 1;
            }
        }
        self.tracker.note_applied(&key, &change.device_id, change.version)?;
        Ok(true)
    }

    fn touch_last_sync(&self, at: Option<chrono::DateTime<Utc>>) -> Result<()> {
        let mut guard = self.device.write();
        if let Some(device) = guard.as_mut() {
            device.last_sync_time = at;
            save_json(self.kv.as_ref(), keys::CURRENT_DEVICE, &*device)?;
        }
        Ok(())
    }

    fn save_session(&self, session: &SyncSession, cap: usize) -> Result<()> {
        let mut sessions = self.sessions.lock();
        sessions.push(session.clone());
        if sessions.len() > cap {
            let excess = sessions.len() - cap;
            sessions.drain(..excess);
        }
        save_json(self.kv.as_ref(), keys::SYNC_SESSIONS, &*sessions)
    }

    /// Session history, oldest first
    pub fn sessions(&self) -> Vec<SyncSession> {
        self.sessions.lock().clone()
    }

    pub fn sync_statistics(&self) -> SyncStatistics {
        let sessions = self.sessions.lock();
        let mut stats = SyncStatistics {
            total_sessions: sessions.len(),
            pending_changes: self.tracker.pending_count(),
            unresolved_conflicts: self.conflicts.unresolved_count(),
            last_sync: self.current_device().and_then(|d| d.last_sync_time),
            ..Default::default()
        };
        for session in sessions.iter() {
            match session.status {
                SyncSessionStatus::Completed => stats.successful_sessions += 1,
                SyncSessionStatus::Failed => stats.failed_sessions += 1,
                SyncSessionStatus::InProgress => {}
            }
            stats.changes_pushed += session.changes_pushed;
            stats.changes_pulled += session.changes_pulled;
            stats.conflicts_detected += session.conflicts_detected;
            stats.conflicts_resolved += session.conflicts_resolved;
            stats.bytes_transferred += session.bytes_transferred;
        }
        stats
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    pub fn conflicts(&self, unresolved_only: bool) -> Vec<DeviceConflict> {
        self.conflicts.list(unresolved_only)
    }

    pub fn conflict(&self, id: &str) -> Result<DeviceConflict> {
        self.conflicts.get(id)
    }

    /// Resolve a conflict and commit the result locally. The entity's version
    /// moves past every conflicting version and the result is queued so peers
    /// fast-forward to it on their next pull.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        selected_device: Option<&str>,
        manual_data: Option<Value>,
    ) -> Result<DeviceConflict> {
        let device = self.current_device().ok_or(KeepsakeError::DeviceNotRegistered)?;
        let conflict = self.conflicts.get(conflict_id)?;
        if conflict.resolved {
            return Err(KeepsakeError::InvalidInput(format!(
                "Conflict {} is already resolved",
                conflict_id
            )));
        }

        let resolution = self
            .resolver
            .resolve(&conflict, strategy, selected_device, manual_data)?;

        let _entity = self.entity_lock.lock().await;
        self.source
            .put_entity(&conflict.entity_type, &conflict.entity_id, resolution.data.clone())
            .await?;
        let record = self.tracker.record_resolution(
            &device.id,
            &conflict.entity_type,
            &conflict.entity_id,
            resolution.data.as_ref(),
            conflict.max_version(),
            &conflict.id,
        )?;
        let resolved = self.conflicts.mark_resolved(&conflict.id, &resolution)?;

        tracing::info!(
            "Resolved conflict {} on {} with {:?} at version {}",
            conflict.id,
            conflict.entity_key(),
            strategy,
            record.version
        );
        Ok(resolved)
    }
}

/// The remote side of a divergence, holding the state the peer wrote
fn remote_version(change: &ChangeRecord, data: Option<Value>) -> ConflictVersion {
    ConflictVersion {
        device_id: change.device_id.clone(),
        version: change.version,
        data,
        checksum: change.new_checksum.clone(),
        timestamp: change.timestamp,
    }
}
