//! Local filesystem provider
//!
//! Layout under the root directory:
//!
//! ```text
//! backups/<backup_id>.json
//! changes/<device_id>/<sequence, zero padded>.json
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{ChangeTransport, StorageProvider};
use crate::error::{KeepsakeError, Result};
use crate::types::{BackupMetadata, BackupPackage, ChangeBatch, StorageInfo};

/// Default quota reported by `storage_info`
const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// File-based provider, always available
pub struct LocalProvider {
    root: PathBuf,
    quota_bytes: u64,
}

impl LocalProvider {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(root.join("backups"))
            .map_err(|e| KeepsakeError::Storage(format!("Failed to create backup dir: {}", e)))?;
        std::fs::create_dir_all(root.join("changes"))
            .map_err(|e| KeepsakeError::Storage(format!("Failed to create changes dir: {}", e)))?;
        Ok(Self {
            root,
            quota_bytes: DEFAULT_QUOTA_BYTES,
        })
    }

    /// Override the capacity reported by `storage_info`
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn backup_path(&self, backup_id: &str) -> Result<PathBuf> {
        validate_component(backup_id)?;
        Ok(self.root.join("backups").join(format!("{}.json", backup_id)))
    }

    fn device_dir(&self, device_id: &str) -> Result<PathBuf> {
        validate_component(device_id)?;
        Ok(self.root.join("changes").join(device_id))
    }

    async fn read_package(path: &Path) -> Result<BackupPackage> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Ids become file names; refuse anything that could escape the root
fn validate_component(id: &str) -> Result<()> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.starts_with('.')
    {
        return Err(KeepsakeError::InvalidInput(format!("Invalid identifier: {}", id)));
    }
    Ok(())
}

async fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn id(&self) -> &str {
        "local"
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(self.root.join("backups"))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn upload(&self, package: &BackupPackage) -> Result<String> {
        let path = self.backup_path(&package.metadata.id)?;
        let raw = serde_json::to_vec(package)?;

        // Write to a temp file first so a crash never leaves a torn package
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!("Stored backup {} ({} bytes)", package.metadata.id, raw.len());
        Ok(path.to_string_lossy().to_string())
    }

    async fn download(&self, backup_id: &str) -> Result<BackupPackage> {
        let path = self.backup_path(backup_id)?;
        match Self::read_package(&path).await {
            Ok(package) => Ok(package),
            Err(KeepsakeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeepsakeError::NotFound(format!("backup {}", backup_id)))
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        let mut result = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("backups")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_package(&path).await {
                Ok(package) => result.push(package.metadata),
                Err(e) => tracing::warn!("Skipping unreadable backup {}: {}", path.display(), e),
            }
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        let path = self.backup_path(backup_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KeepsakeError::NotFound(format!("backup {}", backup_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        let used = dir_size(&self.root).await?;
        Ok(StorageInfo {
            total: self.quota_bytes,
            used,
            available: self.quota_bytes.saturating_sub(used),
        })
    }
}

#[async_trait]
impl ChangeTransport for LocalProvider {
    async fn send_batch(&self, batch: &ChangeBatch) -> Result<()> {
        let dir = self.device_dir(&batch.device.id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{:020}.json", batch.sequence));
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(batch)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn fetch_batches(
        &self,
        cursors: &BTreeMap<String, u64>,
        exclude_device: &str,
    ) -> Result<Vec<ChangeBatch>> {
        let mut batches = Vec::new();
        let mut devices = tokio::fs::read_dir(self.root.join("changes")).await?;

        let mut device_dirs = Vec::new();
        while let Some(entry) = devices.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                device_dirs.push(entry.path());
            }
        }
        device_dirs.sort();

        for dir in device_dirs {
            let device_id = match dir.file_name().and_then(|n| n.to_str()) {
                Some(name) if name != exclude_device => name.to_string(),
                _ => continue,
            };
            let cursor = cursors.get(&device_id).copied().unwrap_or(0);

            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let sequence = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok());
                if let Some(sequence) = sequence {
                    if sequence > cursor && path.extension().and_then(|e| e.to_str()) == Some("json") {
                        files.push((sequence, path));
                    }
                }
            }
            files.sort_by_key(|(sequence, _)| *sequence);

            for (_, path) in files {
                let raw = tokio::fs::read_to_string(&path).await?;
                match serde_json::from_str::<ChangeBatch>(&raw) {
                    Ok(batch) => batches.push(batch),
                    Err(e) => {
                        // Stop at the first unreadable batch so the cursor never skips it
                        tracing::warn!("Unreadable change batch {}: {}", path.display(), e);
                        break;
                    }
                }
            }
        }

        Ok(batches)
    }
}
