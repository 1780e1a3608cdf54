//! Backup pipeline scenarios against real providers
//!
//! Run with: cargo test --test backup_tests

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use keepsake::backup::BackupManager;
use keepsake::kv::{keys, save_json, KeyValueStore, MemoryStore, SqliteStore};
use keepsake::source::{DataSource, MemoryDataSource};
use keepsake::storage::{MemoryProvider, ProviderHandle, ProviderRegistry, SharedProvider, StorageProvider};
use keepsake::types::*;
use keepsake::{KeepsakeService, ServiceOptions};

fn sample_data() -> BackupData {
    let mut data = BackupData::new();
    data.insert(
        "symptoms",
        vec![
            json!({"id": "s1", "name": "Headache", "severity": 3}),
            json!({"id": "s2", "name": "Fatigue", "severity": 2}),
        ],
    );
    data.insert("medications", vec![json!({"id": 7, "name": "Ibuprofen"})]);
    data
}

fn memory_manager(backend: Arc<MemoryProvider>, config: BackupConfig) -> BackupManager {
    let provider: SharedProvider = Arc::new(RwLock::new(ProviderHandle::new(backend)));
    BackupManager::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryDataSource::from_snapshot(sample_data())),
        Arc::new(ProviderRegistry::empty()),
        provider,
        BackupConfig {
            provider: "memory".to_string(),
            ..config
        },
    )
    .unwrap()
}

async fn local_service(
    dir: &std::path::Path,
    kv: Arc<dyn KeyValueStore>,
    source: Arc<MemoryDataSource>,
) -> KeepsakeService {
    save_json(
        kv.as_ref(),
        keys::BACKUP_CONFIG,
        &BackupConfig {
            provider: "local".to_string(),
            local_dir: Some(dir.to_path_buf()),
            ..Default::default()
        },
    )
    .unwrap();
    KeepsakeService::init(
        kv,
        source,
        ServiceOptions {
            start_timers: false,
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_retention_deletes_only_expired_backups() {
    let backend = Arc::new(MemoryProvider::new());
    let manager = memory_manager(
        backend.clone(),
        BackupConfig {
            retention_days: 30,
            ..Default::default()
        },
    );

    let mut ids = Vec::new();
    for age_days in [40, 20, 5] {
        let metadata = manager.create_backup(false).await.unwrap();
        let mut package = backend.download(&metadata.id).await.unwrap();
        package.metadata.created_at = Utc::now() - ChronoDuration::days(age_days);
        backend.overwrite(package);
        ids.push(metadata.id);
    }

    let deleted = manager.cleanup_old_backups().await.unwrap();
    assert_eq!(deleted, vec![ids[0].clone()]);

    let remaining: BTreeSet<String> = manager
        .list_backups()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    let expected: BTreeSet<String> = ids[1..].iter().cloned().collect();
    assert_eq!(remaining, expected);

    // Backdated packages still verify; only metadata age changed
    for id in &ids[1..] {
        assert!(manager.verify_stored(id).await.unwrap().valid);
    }
}

#[tokio::test]
async fn test_history_is_capped() {
    let backend = Arc::new(MemoryProvider::new());
    let manager = memory_manager(
        backend,
        BackupConfig {
            encryption_enabled: false,
            ..Default::default()
        },
    );

    let mut ids = Vec::new();
    for _ in 0..MAX_HISTORY_ENTRIES + 5 {
        ids.push(manager.create_backup(true).await.unwrap().id);
    }

    let history = manager.backup_history();
    assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
    assert_eq!(history[0].id, ids[5]);
    assert_eq!(history.last().unwrap().id, *ids.last().unwrap());
    assert!(history.iter().all(|entry| entry.success));
}

#[tokio::test]
async fn test_restore_through_local_provider() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(MemoryDataSource::from_snapshot(sample_data()));
    let service = local_service(dir.path(), Arc::new(MemoryStore::new()), source.clone()).await;
    assert_eq!(service.provider_id(), "local");

    let metadata = service.backup().create_backup(true).await.unwrap();
    assert!(metadata.encrypted);
    assert!(metadata.compressed);
    assert_eq!(metadata.entities["symptoms"].count, 2);
    assert_eq!(metadata.entities["medications"].count, 1);

    let listed = service.backup().list_backups().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0], metadata);

    source.clear();
    let result = service.backup().restore_from_backup(&metadata.id).await.unwrap();
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(result.restored["symptoms"], 2);
    assert_eq!(result.restored["medications"], 1);
    assert!(result.conflicts.is_empty());
    assert_eq!(source.snapshot(), MemoryDataSource::from_snapshot(sample_data()).snapshot());

    // Restoring over edited data reports what it overwrote
    source.clear();
    let edited = {
        let mut data = BackupData::new();
        data.insert("symptoms", vec![json!({"id": "s1", "name": "Migraine", "severity": 5})]);
        data
    };
    for (entity_type, values) in edited.entities {
        source.restore_entities(&entity_type, values).await.unwrap();
    }
    let result = service.backup().restore_from_backup(&metadata.id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.conflicts, vec!["symptoms/s1".to_string()]);

    service.backup().delete_backup(&metadata.id).await.unwrap();
    assert!(service.backup().list_backups().await.unwrap().is_empty());
    service.shutdown();
}

#[tokio::test]
async fn test_encrypted_backup_needs_key_on_new_installation() {
    let dir = tempfile::tempdir().unwrap();
    let first = local_service(
        dir.path(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryDataSource::from_snapshot(sample_data())),
    )
    .await;
    let metadata = first.backup().create_backup(true).await.unwrap();
    let exported = first.backup().export_key().unwrap().unwrap();

    let state = tempfile::tempdir().unwrap();
    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(state.path().join("keepsake.db")).unwrap());
    let target = Arc::new(MemoryDataSource::new());
    let second = local_service(dir.path(), kv, target.clone()).await;

    let verification = second.backup().verify_stored(&metadata.id).await.unwrap();
    assert!(verification.checksum_valid);
    assert!(verification.signature_valid);
    assert!(!verification.decrypt_valid);
    assert!(!verification.valid);

    let refused = second.backup().restore_from_backup(&metadata.id).await.unwrap();
    assert!(!refused.success);
    assert_eq!(target.count("symptoms"), 0);

    let key_id = second.backup().import_key(&exported).unwrap();
    assert_eq!(metadata.key_id.as_deref(), Some(key_id.as_str()));
    let restored = second.backup().restore_from_backup(&metadata.id).await.unwrap();
    assert!(restored.success, "{:?}", restored.errors);
    assert_eq!(target.count("symptoms"), 2);
}

#[tokio::test]
async fn test_status_reflects_history_and_storage() {
    let dir = tempfile::tempdir().unwrap();
    let service = local_service(
        dir.path(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryDataSource::from_snapshot(sample_data())),
    )
    .await;

    service.backup().create_backup(true).await.unwrap();
    service.backup().create_backup(false).await.unwrap();

    let status = service.backup().backup_status().await;
    assert!(status.enabled);
    assert_eq!(status.provider, "local");
    assert_eq!(status.successful_backups, 2);
    assert_eq!(status.failed_backups, 0);
    assert!(status.last_success.is_some());
    assert!(status.last_failure.is_none());
    assert!(status.storage.map(|info| info.used > 0).unwrap_or(false));
}
