//! JSON File Storage
//!
//! One pretty-printed JSON file per instance under the data directory. Writes go
//! to a temp file first and are renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::StrategyInstance;
use crate::ports::{StorageError, StrategyStorage};

#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    data_dir: PathBuf,
}

impl JsonFileStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn instance_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StorageError::Io(format!("Invalid instance id for storage: {:?}", id)));
        }
        Ok(self.data_dir.join(format!("{}.json", id)))
    }

    async fn read_record(path: &Path) -> Result<StrategyInstance, StorageError> {
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|e| StorageError::Corrupted {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl StrategyStorage for JsonFileStorage {
    /// Unreadable records are logged and skipped so one bad file cannot block startup
    async fn load_instances(&self) -> Result<Vec<StrategyInstance>, StorageError> {
        if !fs::try_exists(&self.data_dir).await? {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.data_dir).await?;
        let mut instances = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable instance record"),
            }
        }

        instances.sort_by_key(|i| i.created_at);
        info!(count = instances.len(), dir = %self.data_dir.display(), "Instances loaded");
        Ok(instances)
    }

    async fn save_instance(&self, instance: &StrategyInstance) -> Result<(), StorageError> {
        let path = self.instance_path(&instance.id)?;
        fs::create_dir_all(&self.data_dir).await?;

        let content = serde_json::to_string_pretty(instance)?;
        // One temp file per write; saves of the same record may overlap
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        debug!(instance_id = %instance.id, status = ?instance.status, "Instance saved");
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), StorageError> {
        let path = self.instance_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(instance_id = %id, "Instance record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
