//! App data collaborator
//!
//! The surrounding app owns its records. Keepsake only needs to collect a
//! full snapshot for backups, write entities back on restore, and read/write
//! single entities while applying sync changes.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{KeepsakeError, Result};
use crate::types::{BackupData, CollectOptions};

/// Entity type holding photo attachments, only collected with `include_photos`
pub const PHOTOS_TYPE: &str = "photos";
/// Entity type holding generated reports, only collected with `include_reports`
pub const REPORTS_TYPE: &str = "reports";

/// Outcome of writing a batch of entities back into the app
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    /// Ids that already existed locally with different content
    pub conflicts: Vec<String>,
}

/// Source and sink for the app's records
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Collect the full snapshot to back up
    async fn collect(&self, options: CollectOptions) -> Result<BackupData>;

    /// Write restored entities of one type
    async fn restore_entities(
        &self,
        entity_type: &str,
        entities: Vec<serde_json::Value>,
    ) -> Result<ApplyReport>;

    async fn get_entity(&self, entity_type: &str, entity_id: &str)
        -> Result<Option<serde_json::Value>>;

    /// Write one entity; `None` deletes it
    async fn put_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<()>;
}

/// Read an entity's id from its `id` field (string or number)
pub fn entity_id_of(value: &serde_json::Value) -> Option<String> {
    match value.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

type EntityMap = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// In-memory data source
#[derive(Default)]
pub struct MemoryDataSource {
    entities: RwLock<EntityMap>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a snapshot; entities without an id are skipped
    pub fn from_snapshot(data: BackupData) -> Self {
        let source = Self::new();
        {
            let mut entities = source.entities.write();
            for (entity_type, values) in data.entities {
                let bucket = entities.entry(entity_type).or_default();
                for value in values {
                    if let Some(id) = entity_id_of(&value) {
                        bucket.insert(id, value);
                    }
                }
            }
        }
        source
    }

    /// Current contents as a snapshot, all types included
    pub fn snapshot(&self) -> BackupData {
        let entities = self.entities.read();
        let mut data = BackupData::new();
        for (entity_type, bucket) in entities.iter() {
            data.insert(entity_type.clone(), bucket.values().cloned().collect());
        }
        data
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.entities
            .read()
            .get(entity_type)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.entities.write().clear();
    }

    fn restore_sync(&self, entity_type: &str, values: Vec<serde_json::Value>) -> Result<ApplyReport> {
        let mut entities = self.entities.write();
        let bucket = entities.entry(entity_type.to_string()).or_default();
        let mut report = ApplyReport::default();

        for value in values {
            let id = entity_id_of(&value).ok_or_else(|| {
                KeepsakeError::InvalidInput(format!("{} entity without id", entity_type))
            })?;
            if let Some(existing) = bucket.get(&id) {
                if existing != &value {
                    report.conflicts.push(id.clone());
                }
            }
            bucket.insert(id, value);
            report.applied += 1;
        }
        Ok(report)
    }

    fn put_sync(&self, entity_type: &str, entity_id: &str, data: Option<serde_json::Value>) {
        let mut entities = self.entities.write();
        match data {
            Some(value) => {
                entities
                    .entry(entity_type.to_string())
                    .or_default()
                    .insert(entity_id.to_string(), value);
            }
            None => {
                if let Some(bucket) = entities.get_mut(entity_type) {
                    bucket.remove(entity_id);
                }
            }
        }
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn collect(&self, options: CollectOptions) -> Result<BackupData> {
        let mut data = self.snapshot();
        if !options.include_photos {
            data.entities.remove(PHOTOS_TYPE);
        }
        if !options.include_reports {
            data.entities.remove(REPORTS_TYPE);
        }
        Ok(data)
    }

    async fn restore_entities(
        &self,
        entity_type: &str,
        entities: Vec<serde_json::Value>,
    ) -> Result<ApplyReport> {
        self.restore_sync(entity_type, entities)
    }

    async fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(self
            .entities
            .read()
            .get(entity_type)
            .and_then(|bucket| bucket.get(entity_id))
            .cloned())
    }

    async fn put_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.put_sync(entity_type, entity_id, data);
        Ok(())
    }
}

/// Data source backed by a JSON snapshot file, rewritten after every mutation
pub struct JsonFileDataSource {
    path: PathBuf,
    inner: MemoryDataSource,
}

impl JsonFileDataSource {
    /// Open `path`; a missing file starts empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match std::fs::read_to_string(&path) {
            Ok(raw) => MemoryDataSource::from_snapshot(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryDataSource::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, inner })
    }

    async fn flush(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.inner.snapshot())?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl DataSource for JsonFileDataSource {
    async fn collect(&self, options: CollectOptions) -> Result<BackupData> {
        self.inner.collect(options).await
    }

    async fn restore_entities(
        &self,
        entity_type: &str,
        entities: Vec<serde_json::Value>,
    ) -> Result<ApplyReport> {
        let report = self.inner.restore_sync(entity_type, entities)?;
        self.flush().await?;
        Ok(report)
    }

    async fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.inner.get_entity(entity_type, entity_id).await
    }

    async fn put_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.inner.put_sync(entity_type, entity_id, data);
        self.flush().await
    }
}
