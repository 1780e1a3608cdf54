//! S3-compatible provider (S3, R2, GCS interop, MinIO)
//!
//! Object layout under the configured prefix:
//!
//! ```text
//! backups/<backup_id>.json        full package
//! backups/<backup_id>.meta.json   metadata sidecar, read by `list`
//! changes/<device_id>/<sequence, zero padded>.json
//! ```

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::collections::BTreeMap;
use tokio::sync::OnceCell;

use super::{ChangeTransport, StorageProvider};
use crate::error::{KeepsakeError, Result};
use crate::types::{BackupMetadata, BackupPackage, ChangeBatch, StorageInfo};

/// Buckets have no intrinsic quota; this is what `storage_info` reports as total
const DEFAULT_QUOTA_BYTES: u64 = 50 * 1024 * 1024 * 1024;

pub struct S3Provider {
    client: OnceCell<S3Client>,
    bucket: String,
    prefix: String,
    quota_bytes: u64,
}

impl S3Provider {
    /// Create from S3-compatible URI (s3://bucket/optional/prefix)
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| KeepsakeError::Config("URI must start with s3://".to_string()))?;

        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(KeepsakeError::Config(
                "URI must be s3://bucket[/prefix]".to_string(),
            ));
        }

        Ok(Self {
            client: OnceCell::new(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            quota_bytes: DEFAULT_QUOTA_BYTES,
        })
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// AWS config is loaded from the environment on first use
    async fn client(&self) -> &S3Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
                S3Client::new(&config)
            })
            .await
    }

    fn key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.client()
            .await
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| KeepsakeError::Provider(format!("put_object {}: {}", key, e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client()
            .await
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    KeepsakeError::NotFound(key.to_string())
                } else {
                    KeepsakeError::Provider(format!("get_object {}: {}", key, service_error))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| KeepsakeError::Provider(format!("get_object body {}: {}", key, e)))?
            .into_bytes();
        Ok(data.to_vec())
    }

    /// Every (key, size) under a prefix, following continuation tokens
    async fn list_keys(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        let client = self.client().await;
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut request = client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(t) = token.take() {
                request = request.continuation_token(t);
            }
            let response = request
                .send()
                .await
                .map_err(|e| KeepsakeError::Provider(format!("list_objects_v2 {}: {}", prefix, e)))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    let size = object.size().unwrap_or(0).max(0) as u64;
                    keys.push((key.to_string(), size));
                }
            }

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }

        Ok(keys)
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn id(&self) -> &str {
        "s3"
    }

    async fn is_available(&self) -> bool {
        self.client()
            .await
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }

    async fn upload(&self, package: &BackupPackage) -> Result<String> {
        let id = &package.metadata.id;
        let key = self.key(&format!("backups/{}.json", id));
        let body = serde_json::to_vec(package)?;
        let size = body.len();

        self.put(&key, body).await?;
        self.put(
            &self.key(&format!("backups/{}.meta.json", id)),
            serde_json::to_vec(&package.metadata)?,
        )
        .await?;

        tracing::info!("Uploaded {} bytes to s3://{}/{}", size, self.bucket, key);
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    async fn download(&self, backup_id: &str) -> Result<BackupPackage> {
        let key = self.key(&format!("backups/{}.json", backup_id));
        let data = self.get(&key).await?;
        tracing::info!(
            "Downloaded {} bytes from s3://{}/{}",
            data.len(),
            self.bucket,
            key
        );
        Ok(serde_json::from_slice(&data)?)
    }

    async fn list(&self) -> Result<Vec<BackupMetadata>> {
        let mut result = Vec::new();
        for (key, _) in self.list_keys(&self.key("backups/")).await? {
            if !key.ends_with(".meta.json") {
                continue;
            }
            match serde_json::from_slice::<BackupMetadata>(&self.get(&key).await?) {
                Ok(metadata) => result.push(metadata),
                Err(e) => tracing::warn!("Skipping unreadable metadata {}: {}", key, e),
            }
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        let client = self.client().await;
        for key in [
            self.key(&format!("backups/{}.json", backup_id)),
            self.key(&format!("backups/{}.meta.json", backup_id)),
        ] {
            client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| KeepsakeError::Provider(format!("delete_object {}: {}", key, e)))?;
        }
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo> {
        let used: u64 = self
            .list_keys(&self.key(""))
            .await?
            .iter()
            .map(|(_, size)| size)
            .sum();
        Ok(StorageInfo {
            total: self.quota_bytes,
            used,
            available: self.quota_bytes.saturating_sub(used),
        })
    }
}

#[async_trait]
impl ChangeTransport for S3Provider {
    async fn send_batch(&self, batch: &ChangeBatch) -> Result<()> {
        let key = self.key(&format!(
            "changes/{}/{:020}.json",
            batch.device.id, batch.sequence
        ));
        self.put(&key, serde_json::to_vec(batch)?).await
    }

    async fn fetch_batches(
        &self,
        cursors: &BTreeMap<String, u64>,
        exclude_device: &str,
    ) -> Result<Vec<ChangeBatch>> {
        let changes_prefix = self.key("changes/");
        let mut pending: BTreeMap<(String, u64), String> = BTreeMap::new();

        for (key, _) in self.list_keys(&changes_prefix).await? {
            let Some(relative) = key.strip_prefix(&changes_prefix) else {
                continue;
            };
            let Some((device_id, file)) = relative.split_once('/') else {
                continue;
            };
            if device_id == exclude_device {
                continue;
            }
            let Some(sequence) = file
                .strip_suffix(".json")
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if sequence > cursors.get(device_id).copied().unwrap_or(0) {
                pending.insert((device_id.to_string(), sequence), key.clone());
            }
        }

        let mut batches = Vec::with_capacity(pending.len());
        for key in pending.values() {
            batches.push(serde_json::from_slice(&self.get(key).await?)?);
        }
        Ok(batches)
    }
}
