//! Multi-device sync scenarios
//!
//! Each simulated device has its own key-value store and data source; all of
//! them exchange batches through one shared in-process provider.
//!
//! Run with: cargo test --test sync_tests

use async_trait::async_trait;
use parking_lot::RwLock;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keepsake::codec;
use keepsake::error::{KeepsakeError, Result};
use keepsake::kv::MemoryStore;
use keepsake::source::{DataSource, MemoryDataSource};
use keepsake::storage::{ChangeTransport, MemoryProvider, ProviderHandle, SharedProvider, StorageProvider};
use keepsake::types::*;

struct TestDevice {
    sync: Arc<keepsake::SyncCoordinator>,
    source: Arc<MemoryDataSource>,
}

impl TestDevice {
    /// A device whose data source takes `write_delay` for every write
    fn build(name: &str, handle: ProviderHandle, config: MultiDeviceSyncConfig, write_delay: Duration) -> Self {
        let source = Arc::new(MemoryDataSource::new());
        let sink: Arc<dyn DataSource> = if write_delay.is_zero() {
            source.clone()
        } else {
            Arc::new(SlowSource {
                inner: source.clone(),
                delay: write_delay,
            })
        };
        let provider: SharedProvider = Arc::new(RwLock::new(handle));
        let sync = Arc::new(
            keepsake::SyncCoordinator::new(
                Arc::new(MemoryStore::new()),
                sink,
                provider,
                config,
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        sync.register_device(Some(name)).unwrap();
        Self { sync, source }
    }

    fn with_handle(name: &str, handle: ProviderHandle) -> Self {
        Self::build(name, handle, MultiDeviceSyncConfig::default(), Duration::ZERO)
    }

    fn new(name: &str, backend: &Arc<MemoryProvider>) -> Self {
        Self::with_handle(name, ProviderHandle::new(backend.clone()))
    }

    fn id(&self) -> String {
        self.sync.current_device().unwrap().id
    }

    /// Write through the coordinator, the way the app does
    async fn write(&self, id: &str, data: Value) {
        let previous = self.source.get_entity("symptoms", id).await.unwrap();
        let operation = if previous.is_some() {
            ChangeOperation::Update
        } else {
            ChangeOperation::Create
        };
        self.sync
            .record_change("symptoms", id, operation, Some(&data), previous.as_ref())
            .await
            .unwrap();
    }

    async fn read(&self, id: &str) -> Option<Value> {
        self.source.get_entity("symptoms", id).await.unwrap()
    }

    async fn sync(&self) -> SyncSession {
        let session = self.sync.sync().await.unwrap();
        assert_eq!(session.status, SyncSessionStatus::Completed, "{:?}", session.error);
        session
    }

    fn version(&self, id: &str) -> u64 {
        self.sync.manifest().version(&entity_key("symptoms", id))
    }
}

/// Two devices that both hold version 1 of `s1` and then edit it independently
async fn diverged_pair(backend: &Arc<MemoryProvider>) -> (TestDevice, TestDevice) {
    let a = TestDevice::new("Phone", backend);
    let b = TestDevice::new("Tablet", backend);

    a.write("s1", json!({"id": "s1", "severity": 1})).await;
    a.sync().await;
    b.sync().await;

    a.write("s1", json!({"id": "s1", "severity": 3})).await;
    b.write("s1", json!({"id": "s1", "severity": 5})).await;
    a.sync().await;
    let session = b.sync().await;
    assert_eq!(session.conflicts_detected, 1);
    let session = a.sync().await;
    assert_eq!(session.conflicts_detected, 1);

    (a, b)
}

#[tokio::test]
async fn test_changes_fast_forward_to_peer() {
    let backend = Arc::new(MemoryProvider::new());
    let a = TestDevice::new("Phone", &backend);
    let b = TestDevice::new("Tablet", &backend);

    a.write("s1", json!({"id": "s1", "severity": 2})).await;
    a.write("s2", json!({"id": "s2", "severity": 4})).await;
    let pushed = a.sync().await;
    assert_eq!(pushed.changes_pushed, 2);

    let pulled = b.sync().await;
    assert_eq!(pulled.changes_pulled, 2);
    assert_eq!(pulled.conflicts_detected, 0);
    assert_eq!(b.read("s1").await, Some(json!({"id": "s1", "severity": 2})));
    assert_eq!(b.version("s1"), 1);

    // B edits on top of what it pulled; A fast-forwards
    b.write("s1", json!({"id": "s1", "severity": 1})).await;
    assert_eq!(b.version("s1"), 2);
    b.sync().await;
    let session = a.sync().await;
    assert_eq!(session.conflicts_detected, 0);
    assert_eq!(a.read("s1").await, Some(json!({"id": "s1", "severity": 1})));
    assert_eq!(a.version("s1"), 2);

    // Nothing new the second time around
    let idle = b.sync().await;
    assert_eq!(idle.changes_pulled, 0);

    let peers: Vec<String> = a.sync.known_devices().into_iter().map(|d| d.name).collect();
    assert_eq!(peers, vec!["Tablet".to_string()]);
}

#[tokio::test]
async fn test_deletes_propagate() {
    let backend = Arc::new(MemoryProvider::new());
    let a = TestDevice::new("Phone", &backend);
    let b = TestDevice::new("Tablet", &backend);

    a.write("s1", json!({"id": "s1"})).await;
    a.sync().await;
    b.sync().await;
    assert!(b.read("s1").await.is_some());

    let previous = a.read("s1").await;
    a.sync
        .record_change("symptoms", "s1", ChangeOperation::Delete, None, previous.as_ref())
        .await
        .unwrap();
    assert_eq!(a.read("s1").await, None);
    a.sync().await;
    b.sync().await;

    assert_eq!(b.read("s1").await, None);
    assert_eq!(b.version("s1"), 2);
}

#[tokio::test]
async fn test_divergent_edits_become_conflicts_on_both_sides() {
    let backend = Arc::new(MemoryProvider::new());
    let (a, b) = diverged_pair(&backend).await;

    // Neither side applied the other's edit
    assert_eq!(a.read("s1").await, Some(json!({"id": "s1", "severity": 3})));
    assert_eq!(b.read("s1").await, Some(json!({"id": "s1", "severity": 5})));

    let conflicts = b.sync.conflicts(true);
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.entity_key(), "symptoms/s1");
    assert!(!conflict.resolved);
    let mut devices: Vec<String> = conflict.versions.iter().map(|v| v.device_id.clone()).collect();
    devices.sort();
    let mut expected = vec![a.id(), b.id()];
    expected.sort();
    assert_eq!(devices, expected);
    assert!(conflict.versions.iter().all(|v| v.version == 2));

    // Further syncs do not resolve anything on their own
    b.sync().await;
    a.sync().await;
    assert_eq!(b.sync.conflicts(true).len(), 1);
    assert_eq!(a.sync.conflicts(true).len(), 1);
    assert_eq!(b.sync.sync_statistics().unresolved_conflicts, 1);
}

#[tokio::test]
async fn test_use_device_resolution_converges() {
    let backend = Arc::new(MemoryProvider::new());
    let (a, b) = diverged_pair(&backend).await;
    let a_checksum = codec::checksum_value(&json!({"id": "s1", "severity": 3}));

    let conflict_id = b.sync.conflicts(true)[0].id.clone();
    let resolved = b
        .sync
        .resolve_conflict(&conflict_id, ResolutionStrategy::UseDevice, Some(&a.id()), None)
        .await
        .unwrap();
    assert!(resolved.resolved);
    assert_eq!(resolved.selected_device, Some(a.id()));
    assert!(resolved.resolved_at.is_some());

    // The winner is committed past every conflicting version
    assert_eq!(b.read("s1").await, Some(json!({"id": "s1", "severity": 3})));
    assert_eq!(b.version("s1"), 3);
    assert_eq!(
        b.sync.manifest().checksum("symptoms/s1"),
        Some(a_checksum.as_str())
    );
    let pending = b.sync.pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].resolution_of.as_deref(), Some(conflict_id.as_str()));

    let session = b.sync().await;
    assert_eq!(session.conflicts_resolved, 1);

    // A still has its own open conflict; the peer's resolution joins it
    a.sync().await;
    let open = a.sync.conflicts(true);
    assert_eq!(open.len(), 1);
    let peer_side = open[0]
        .versions
        .iter()
        .find(|v| v.device_id == b.id())
        .unwrap();
    assert_eq!(peer_side.version, 3);
    assert_eq!(peer_side.checksum, a_checksum);

    a.sync
        .resolve_conflict(&open[0].id, ResolutionStrategy::UseDevice, Some(&b.id()), None)
        .await
        .unwrap();
    assert_eq!(a.version("s1"), 4);
    a.sync().await;
    b.sync().await;

    assert_eq!(a.read("s1").await, b.read("s1").await);
    assert_eq!(b.version("s1"), 4);
    assert!(a.sync.conflicts(true).is_empty());
    assert!(b.sync.conflicts(true).is_empty());
    assert_eq!(b.sync.conflicts(false).len(), 1);
}

#[tokio::test]
async fn test_manual_resolution_requires_data() {
    let backend = Arc::new(MemoryProvider::new());
    let (_a, b) = diverged_pair(&backend).await;
    let conflict_id = b.sync.conflicts(true)[0].id.clone();

    let missing = b
        .sync
        .resolve_conflict(&conflict_id, ResolutionStrategy::Manual, None, None)
        .await;
    assert!(missing.is_err());
    assert_eq!(b.sync.conflicts(true).len(), 1);

    let chosen = json!({"id": "s1", "severity": 4, "note": "agreed"});
    b.sync
        .resolve_conflict(&conflict_id, ResolutionStrategy::Manual, None, Some(chosen.clone()))
        .await
        .unwrap();
    assert_eq!(b.read("s1").await, Some(chosen));

    let again = b
        .sync
        .resolve_conflict(&conflict_id, ResolutionStrategy::Manual, None, Some(json!({})))
        .await;
    assert!(matches!(again, Err(KeepsakeError::InvalidInput(_))));

    let unknown = b
        .sync
        .resolve_conflict("missing", ResolutionStrategy::Merge, None, None)
        .await;
    assert!(matches!(unknown, Err(KeepsakeError::ConflictNotFound(_))));
}

#[tokio::test]
async fn test_corrupted_batch_is_skipped_until_repaired() {
    let backend = Arc::new(MemoryProvider::new());
    let a = TestDevice::new("Phone", &backend);
    let b = TestDevice::new("Tablet", &backend);

    a.write("s1", json!({"id": "s1"})).await;
    a.sync().await;
    a.write("s2", json!({"id": "s2"})).await;
    a.sync().await;

    backend.tamper_batch(&a.id(), 1, |batch| batch.changes[0].version += 10);
    let session = b.sync().await;
    assert_eq!(session.changes_pulled, 0);
    assert_eq!(b.read("s1").await, None);
    // Later batches from the same device wait behind the bad one
    assert_eq!(b.read("s2").await, None);

    backend.tamper_batch(&a.id(), 1, |batch| batch.changes[0].version -= 10);
    let session = b.sync().await;
    assert_eq!(session.changes_pulled, 2);
    assert!(b.read("s1").await.is_some());
    assert!(b.read("s2").await.is_some());
}

/// Memory backend whose batch fetches take a while
struct SlowProvider {
    inner: Arc<MemoryProvider>,
    delay: Duration,
}

#[async_trait]
impl StorageProvider for SlowProvider {
    fn id(&self) -> &str {
        "slow"
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn upload(&self, package: &BackupPackage) -> Result<String> {
        self.inner.upload(package).await
    }

    async fn download(&self, backup_id: &str) -> Result<BackupPackage> {
        self.inner.download(backup_id).await
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        self.inner.list().await
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        self.inner.delete(backup_id).await
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        self.inner.storage_info().await
    }
}

#[async_trait]
impl ChangeTransport for SlowProvider {
    async fn send_batch(&self, batch: &ChangeBatch) -> Result<()> {
        self.inner.send_batch(batch).await
    }

    async fn fetch_batches(
        &self,
        cursors: &BTreeMap<String, u64>,
        exclude_device: &str,
    ) -> Result<Vec<ChangeBatch>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch_batches(cursors, exclude_device).await
    }
}

#[tokio::test]
async fn test_concurrent_sync_is_rejected() {
    let backend = Arc::new(MemoryProvider::new());
    let device = TestDevice::with_handle(
        "Phone",
        ProviderHandle::new(Arc::new(SlowProvider {
            inner: backend,
            delay: Duration::from_millis(200),
        })),
    );

    let running = {
        let sync = device.sync.clone();
        tokio::spawn(async move { sync.sync().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.sync.is_syncing());
    assert!(matches!(device.sync.sync().await, Err(KeepsakeError::SyncInProgress)));

    let session = running.await.unwrap().unwrap();
    assert_eq!(session.status, SyncSessionStatus::Completed);
    assert!(!device.sync.is_syncing());

    // Only the session that ran is recorded
    assert_eq!(device.sync.sessions().len(), 1);
}

#[tokio::test]
async fn test_timed_out_fetch_fails_session() {
    let backend = Arc::new(MemoryProvider::new());
    let device = TestDevice::with_handle(
        "Phone",
        ProviderHandle::new(Arc::new(SlowProvider {
            inner: backend,
            delay: Duration::from_millis(500),
        })),
    );
    device.sync.set_request_timeout(Duration::from_millis(50));

    let session = device.sync.sync().await.unwrap();
    assert_eq!(session.status, SyncSessionStatus::Failed);
    assert!(session.error.is_some());
    assert!(!device.sync.is_syncing());
}

/// Memory backend that stores every batch but reports the Nth send as failed,
/// like a connection dropped before the response arrived
struct LostAckProvider {
    inner: Arc<MemoryProvider>,
    sends: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl StorageProvider for LostAckProvider {
    fn id(&self) -> &str {
        "lost-ack"
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn upload(&self, package: &BackupPackage) -> Result<String> {
        self.inner.upload(package).await
    }

    async fn download(&self, backup_id: &str) -> Result<BackupPackage> {
        self.inner.download(backup_id).await
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        self.inner.list().await
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        self.inner.delete(backup_id).await
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        self.inner.storage_info().await
    }
}

#[async_trait]
impl ChangeTransport for LostAckProvider {
    async fn send_batch(&self, batch: &ChangeBatch) -> Result<()> {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.send_batch(batch).await?;
        if attempt == self.fail_on {
            return Err(KeepsakeError::Provider("connection reset".to_string()));
        }
        Ok(())
    }

    async fn fetch_batches(
        &self,
        cursors: &BTreeMap<String, u64>,
        exclude_device: &str,
    ) -> Result<Vec<ChangeBatch>> {
        self.inner.fetch_batches(cursors, exclude_device).await
    }
}

/// Memory data source whose writes take a while
struct SlowSource {
    inner: Arc<MemoryDataSource>,
    delay: Duration,
}

#[async_trait]
impl DataSource for SlowSource {
    async fn collect(&self, options: CollectOptions) -> Result<BackupData> {
        self.inner.collect(options).await
    }

    async fn restore_entities(
        &self,
        entity_type: &str,
        entities: Vec<Value>,
    ) -> Result<keepsake::source::ApplyReport> {
        self.inner.restore_entities(entity_type, entities).await
    }

    async fn get_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<Value>> {
        self.inner.get_entity(entity_type, entity_id).await
    }

    async fn put_entity(&self, entity_type: &str, entity_id: &str, data: Option<Value>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_entity(entity_type, entity_id, data).await
    }
}

#[tokio::test]
async fn test_replayed_batches_do_not_conflict() {
    let backend = Arc::new(MemoryProvider::new());
    let a = TestDevice::build(
        "Phone",
        ProviderHandle::new(Arc::new(LostAckProvider {
            inner: backend.clone(),
            sends: AtomicUsize::new(0),
            fail_on: 2,
        })),
        MultiDeviceSyncConfig {
            max_changes_per_batch: 1,
            ..Default::default()
        },
        Duration::ZERO,
    );
    let b = TestDevice::new("Tablet", &backend);

    a.write("s1", json!({"id": "s1", "severity": 1})).await;
    a.write("s2", json!({"id": "s2", "severity": 2})).await;
    let failed = a.sync.sync().await.unwrap();
    assert_eq!(failed.status, SyncSessionStatus::Failed);
    assert_eq!(a.sync.pending_changes().len(), 2);

    // Both batches landed even though the second send reported failure
    let pulled = b.sync().await;
    assert_eq!(pulled.changes_pulled, 2);
    b.write("s1", json!({"id": "s1", "severity": 4})).await;
    b.sync().await;

    // The retry re-sends both changes, then picks up B's edit
    let retry = a.sync().await;
    assert_eq!(retry.changes_pushed, 2);
    assert_eq!(retry.conflicts_detected, 0);
    assert_eq!(a.read("s1").await, Some(json!({"id": "s1", "severity": 4})));

    let replayed = b.sync().await;
    assert_eq!(replayed.changes_pulled, 0);
    assert_eq!(replayed.conflicts_detected, 0);
    assert!(b.sync.conflicts(false).is_empty());
    assert_eq!(b.read("s1").await, Some(json!({"id": "s1", "severity": 4})));
    assert_eq!(b.version("s1"), 2);
    assert_eq!(b.read("s2").await, Some(json!({"id": "s2", "severity": 2})));
}

/// Data the given peer contributed to this device's open conflict
fn peer_side(device: &TestDevice, peer: &str) -> Option<Value> {
    let conflicts = device.sync.conflicts(true);
    conflicts[0]
        .versions
        .iter()
        .find(|v| v.device_id == peer)
        .and_then(|v| v.data.clone())
}

#[tokio::test]
async fn test_delta_conflict_keeps_peer_state() {
    let backend = Arc::new(MemoryProvider::new());
    let config = MultiDeviceSyncConfig {
        use_delta_sync: true,
        ..Default::default()
    };
    let a = TestDevice::build("Phone", ProviderHandle::new(backend.clone()), config.clone(), Duration::ZERO);
    let b = TestDevice::build("Tablet", ProviderHandle::new(backend.clone()), config, Duration::ZERO);

    a.write("s1", json!({"id": "s1", "severity": 1, "notes": "orig"})).await;
    a.sync().await;
    b.sync().await;

    // Each side changes a different field of the same base
    let a_state = json!({"id": "s1", "severity": 3, "notes": "orig"});
    let b_state = json!({"id": "s1", "severity": 1, "notes": "edited"});
    a.write("s1", a_state.clone()).await;
    b.write("s1", b_state.clone()).await;
    assert!(matches!(
        a.sync.pending_changes()[0].payload,
        ChangePayload::Delta { .. }
    ));

    a.sync().await;
    assert_eq!(b.sync().await.conflicts_detected, 1);
    assert_eq!(a.sync().await.conflicts_detected, 1);
    assert_eq!(peer_side(&b, &a.id()), Some(a_state.clone()));
    assert_eq!(peer_side(&a, &b.id()), Some(b_state));

    let conflict_id = b.sync.conflicts(true)[0].id.clone();
    b.sync
        .resolve_conflict(&conflict_id, ResolutionStrategy::UseDevice, Some(&a.id()), None)
        .await
        .unwrap();
    let a_checksum = codec::checksum_value(&a_state);
    assert_eq!(b.read("s1").await, Some(a_state));
    assert_eq!(
        b.sync.manifest().checksum("symptoms/s1"),
        Some(a_checksum.as_str())
    );
}

#[tokio::test]
async fn test_local_write_waits_for_change_being_applied() {
    let backend = Arc::new(MemoryProvider::new());
    let a = TestDevice::new("Phone", &backend);
    let b = TestDevice::build(
        "Tablet",
        ProviderHandle::new(backend.clone()),
        MultiDeviceSyncConfig::default(),
        Duration::from_millis(200),
    );

    a.write("s1", json!({"id": "s1", "severity": 1})).await;
    a.sync().await;

    let pulling = {
        let sync = b.sync.clone();
        tokio::spawn(async move { sync.sync().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.sync.is_syncing());

    let mine = json!({"id": "s1", "severity": 7});
    let record = b
        .sync
        .record_change("symptoms", "s1", ChangeOperation::Update, Some(&mine), None)
        .await
        .unwrap();
    let session = pulling.await.unwrap().unwrap();
    assert_eq!(session.changes_pulled, 1);

    // The local edit lands on top of the pulled version, not under it
    assert_eq!(record.parent_version, 1);
    assert_eq!(record.version, 2);
    assert_eq!(b.read("s1").await, Some(mine.clone()));
    assert_eq!(
        b.sync.manifest().checksum("symptoms/s1"),
        Some(codec::checksum_value(&mine).as_str())
    );
}

#[tokio::test]
async fn test_auto_sync_skips_while_session_runs() {
    let backend = Arc::new(MemoryProvider::new());
    let device = TestDevice::build(
        "Phone",
        ProviderHandle::new(Arc::new(SlowProvider {
            inner: backend.clone(),
            delay: Duration::from_millis(200),
        })),
        MultiDeviceSyncConfig {
            auto_sync: true,
            ..Default::default()
        },
        Duration::ZERO,
    );

    let running = {
        let sync = device.sync.clone();
        tokio::spawn(async move { sync.sync().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.sync.is_syncing());

    device.write("s1", json!({"id": "s1"})).await;
    running.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // No second session was started for the change
    assert_eq!(device.sync.sessions().len(), 1);
    assert_eq!(device.sync.pending_changes().len(), 1);
    assert_eq!(backend.batch_count(), 0);

    let session = device.sync().await;
    assert_eq!(session.changes_pushed, 1);
    assert_eq!(backend.batch_count(), 1);
}

#[tokio::test]
async fn test_change_not_matching_its_checksum_is_skipped() {
    let backend = Arc::new(MemoryProvider::new());
    let a = TestDevice::new("Phone", &backend);
    let b = TestDevice::new("Tablet", &backend);

    a.write("s1", json!({"id": "s1", "severity": 2})).await;
    let mut change = a.sync.pending_changes().remove(0);
    change.payload = ChangePayload::Full {
        data: json!({"id": "s1", "severity": 9}),
    };
    let device = a.sync.current_device().unwrap();
    let batch = keepsake::sync::transport::build_batch(&device, 1, vec![change]).unwrap();
    backend.send_batch(&batch).await.unwrap();

    let session = b.sync().await;
    assert_eq!(session.changes_pulled, 0);
    assert_eq!(b.read("s1").await, None);
    assert_eq!(b.version("s1"), 0);
    assert!(b.sync.conflicts(false).is_empty());
}
