//! Service lifecycle
//!
//! [`KeepsakeService`] is built once at startup and owns every piece of
//! state: configs, the resolved provider, the backup manager, the sync
//! coordinator and the timers. Nothing lives in globals; tear down with
//! [`KeepsakeService::shutdown`].

use parking_lot::RwLock;
use std::sync::Arc;

use crate::backup::BackupManager;
use crate::error::{KeepsakeError, Result};
use crate::kv::{keys, load_json, KeyValueStore};
use crate::scheduler::{job, Scheduler};
use crate::source::DataSource;
use crate::storage::{ProviderRegistry, SharedProvider};
use crate::sync::SyncCoordinator;
use crate::types::{BackupConfig, MultiDeviceSyncConfig};

/// Construction options
pub struct ServiceOptions {
    pub registry: ProviderRegistry,
    /// Start the backup and sync timers during init
    pub start_timers: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            registry: ProviderRegistry::with_defaults(),
            start_timers: true,
        }
    }
}

pub struct KeepsakeService {
    backup: Arc<BackupManager>,
    sync: Arc<SyncCoordinator>,
    provider: SharedProvider,
    scheduler: Scheduler,
}

impl KeepsakeService {
    /// Load configuration, resolve the provider, register the device when
    /// configured to, and start timers
    pub async fn init(
        kv: Arc<dyn KeyValueStore>,
        source: Arc<dyn DataSource>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let backup_config: BackupConfig =
            load_json(kv.as_ref(), keys::BACKUP_CONFIG)?.unwrap_or_default();
        backup_config.validate()?;
        let sync_config: MultiDeviceSyncConfig =
            load_json(kv.as_ref(), keys::SYNC_CONFIG)?.unwrap_or_default();
        sync_config.validate()?;

        let registry = Arc::new(options.registry);
        let handle = registry.resolve(&backup_config).await?;
        tracing::info!("Using storage provider '{}'", handle.id());
        let provider: SharedProvider = Arc::new(RwLock::new(handle));

        let sync = Arc::new(SyncCoordinator::new(
            kv.clone(),
            source.clone(),
            provider.clone(),
            sync_config.clone(),
            backup_config.request_timeout(),
        )?);
        if sync_config.enabled && sync_config.auto_register_device {
            sync.register_device(None)?;
        }

        let backup = Arc::new(BackupManager::new(
            kv,
            source,
            registry,
            provider.clone(),
            backup_config,
        )?);

        let service = Self {
            backup,
            sync,
            provider,
            scheduler: Scheduler::new(),
        };
        if options.start_timers {
            service.restart_backup_timer();
            service.restart_sync_timer();
        }
        Ok(service)
    }

    pub fn backup(&self) -> &Arc<BackupManager> {
        &self.backup
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    /// Id of the provider currently in use (after any fallback)
    pub fn provider_id(&self) -> String {
        self.provider.read().id().to_string()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Persist a new backup config and restart or stop the backup timer
    pub async fn update_backup_config(&self, config: BackupConfig) -> Result<()> {
        self.backup.update_config(config).await?;
        self.sync.set_request_timeout(self.backup.config().request_timeout());
        self.restart_backup_timer();
        Ok(())
    }

    /// Persist a new sync config and restart or stop the sync timer
    pub async fn update_sync_config(&self, config: MultiDeviceSyncConfig) -> Result<()> {
        self.sync.update_config(config)?;
        self.restart_sync_timer();
        Ok(())
    }

    fn restart_backup_timer(&self) {
        let config = self.backup.config();
        if !(config.enabled && config.auto_backup) {
            self.scheduler.stop_backup();
            return;
        }

        let backup = self.backup.clone();
        self.scheduler.start_backup(
            config.backup_frequency.interval(),
            job(move || {
                let backup = backup.clone();
                async move {
                    if let Err(e) = backup.create_backup(false).await {
                        tracing::warn!("Scheduled backup failed: {}", e);
                    }
                }
            }),
        );
    }

    fn restart_sync_timer(&self) {
        let config = self.sync.config();
        if !(config.enabled && config.auto_sync) {
            self.scheduler.stop_sync();
            return;
        }

        let sync = self.sync.clone();
        self.scheduler.start_sync(
            config.interval(),
            job(move || {
                let sync = sync.clone();
                async move {
                    match sync.sync().await {
                        Ok(_) => {}
                        Err(KeepsakeError::SyncInProgress) => {
                            tracing::debug!("Scheduled sync skipped, one is already running")
                        }
                        Err(e) => tracing::warn!("Scheduled sync failed: {}", e),
                    }
                }
            }),
        );
    }

    /// Stop the timers. In-flight runs are left to finish.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        tracing::info!("Keepsake service stopped");
    }
}
