//! Storage provider abstraction
//!
//! Every backend implements two contracts against the same remote location:
//! `StorageProvider` moves backup packages, `ChangeTransport` exchanges
//! checksummed change batches between devices. The `ProviderRegistry` maps
//! provider ids to constructors and falls back to the local filesystem
//! provider when the configured one is unknown, unimplemented or unavailable.

mod local;
mod memory;
#[cfg(feature = "cloud")]
mod s3;

pub use local::LocalProvider;
pub use memory::MemoryProvider;
#[cfg(feature = "cloud")]
pub use s3::S3Provider;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{KeepsakeError, Result};
use crate::types::{BackupConfig, BackupMetadata, BackupPackage, ChangeBatch, StorageInfo};

/// Provider ids the app recognizes but this build does not implement
pub const UNIMPLEMENTED_PROVIDERS: &[&str] = &["icloud", "google_drive", "dropbox", "onedrive"];

/// Backend contract for backup packages
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Provider id as used in configuration and metadata
    fn id(&self) -> &str;

    async fn is_available(&self) -> bool;

    /// Store a package, returning its locator
    async fn upload(&self, package: &BackupPackage) -> Result<String>;

    async fn download(&self, backup_id: &str) -> Result<BackupPackage>;

    /// Metadata of every stored backup, newest first
    async fn list(&self) -> Result<Vec<BackupMetadata>>;

    async fn delete(&self, backup_id: &str) -> Result<()>;

    async fn storage_info(&self) -> Result<StorageInfo>;
}

/// Backend contract for exchanging change batches between devices
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    async fn send_batch(&self, batch: &ChangeBatch) -> Result<()>;

    /// Batches from every device except `exclude_device` whose sequence is
    /// above that device's cursor, ordered by device then sequence
    async fn fetch_batches(
        &self,
        cursors: &BTreeMap<String, u64>,
        exclude_device: &str,
    ) -> Result<Vec<ChangeBatch>>;
}

/// One backend seen through both contracts
#[derive(Clone)]
pub struct ProviderHandle {
    pub storage: Arc<dyn StorageProvider>,
    pub transport: Arc<dyn ChangeTransport>,
}

impl ProviderHandle {
    pub fn new<T>(backend: Arc<T>) -> Self
    where
        T: StorageProvider + ChangeTransport + 'static,
    {
        Self {
            storage: backend.clone(),
            transport: backend,
        }
    }

    pub fn id(&self) -> &str {
        self.storage.id()
    }
}

/// The active provider, shared by the backup and sync pipelines and swapped
/// when the configured provider changes
pub type SharedProvider = Arc<parking_lot::RwLock<ProviderHandle>>;

/// Constructor registered under a provider id
pub type ProviderConstructor = Box<dyn Fn(&BackupConfig) -> Result<ProviderHandle> + Send + Sync>;

/// Maps provider ids to constructors
pub struct ProviderRegistry {
    constructors: HashMap<String, ProviderConstructor>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderRegistry {
    /// Empty registry; `local` is still used as the fallback
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with `local`, `memory` and (with the `cloud` feature) `s3`
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("local", |config: &BackupConfig| {
            Ok(ProviderHandle::new(Arc::new(LocalProvider::new(
                local_root(config),
            )?)))
        });

        let shared = Arc::new(MemoryProvider::new());
        registry.register("memory", move |_config: &BackupConfig| {
            Ok(ProviderHandle::new(shared.clone()))
        });

        #[cfg(feature = "cloud")]
        registry.register("s3", |config: &BackupConfig| {
            let uri = config.cloud_uri.as_deref().ok_or_else(|| {
                KeepsakeError::Config("cloudUri is required for the s3 provider".to_string())
            })?;
            Ok(ProviderHandle::new(Arc::new(S3Provider::from_uri(uri)?)))
        });

        registry
    }

    pub fn register<F>(&mut self, id: impl Into<String>, constructor: F)
    where
        F: Fn(&BackupConfig) -> Result<ProviderHandle> + Send + Sync + 'static,
    {
        self.constructors.insert(id.into(), Box::new(constructor));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.constructors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Construct the configured provider without the availability check
    pub fn create(&self, config: &BackupConfig) -> Result<ProviderHandle> {
        match self.constructors.get(&config.provider) {
            Some(constructor) => constructor(config),
            None if UNIMPLEMENTED_PROVIDERS.contains(&config.provider.as_str()) => {
                Err(KeepsakeError::Provider(format!(
                    "Provider '{}' is not implemented",
                    config.provider
                )))
            }
            None => Err(KeepsakeError::Config(format!(
                "Unknown storage provider: {}",
                config.provider
            ))),
        }
    }

    /// Construct the configured provider, falling back to `local` when it
    /// cannot be built or reports itself unavailable
    pub async fn resolve(&self, config: &BackupConfig) -> Result<ProviderHandle> {
        match self.create(config) {
            Ok(handle) => {
                let available =
                    with_timeout(config.request_timeout(), async { Ok(handle.storage.is_available().await) })
                        .await
                        .unwrap_or(false);
                if available || config.provider == "local" {
                    return Ok(handle);
                }
                tracing::warn!(
                    "Storage provider '{}' is unavailable, falling back to local",
                    config.provider
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Storage provider '{}' could not be created ({}), falling back to local",
                    config.provider,
                    e
                );
            }
        }

        Ok(ProviderHandle::new(Arc::new(LocalProvider::new(
            local_root(config),
        )?)))
    }
}

/// Root directory for the local provider
pub fn local_root(config: &BackupConfig) -> PathBuf {
    config.local_dir.clone().unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keepsake")
            .join("backups")
    })
}

/// Run a provider call with an upper bound; a timeout fails the call
pub async fn with_timeout<T, F>(duration: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(KeepsakeError::Timeout(duration)),
    }
}
