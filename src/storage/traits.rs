use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt value under '{key}': {message}")]
    Corrupt {
        key: String,
        message: String,
    },
}

impl StorageError {
    pub(crate) fn corrupt(key: &str, err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

/// Durable string key-value store surviving process restart.
///
/// Consumed by the tiered cache (tier 2), the offline queue, the rate
/// limiter's usage counters and the sync engine's pending-change log.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Delete several keys, returning how many were requested.
    /// Default implementation falls back to sequential deletes.
    async fn delete_batch(&self, keys: &[String]) -> Result<usize, StorageError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }
}
