//! Strategy Storage Port

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::StrategyInstance;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted record {path}: {reason}")]
    Corrupted { path: String, reason: String },
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StrategyStorage: Send + Sync {
    async fn load_instances(&self) -> Result<Vec<StrategyInstance>, StorageError>;

    async fn save_instance(&self, instance: &StrategyInstance) -> Result<(), StorageError>;

    async fn delete_instance(&self, id: &str) -> Result<(), StorageError>;
}
