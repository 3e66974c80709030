//! Durable key-value storage.
//!
//! - [`traits::KvStore`]: the async store seam every component persists through
//! - [`memory::MemoryKvStore`]: DashMap-backed, process-local
//! - [`sqlite::SqliteKvStore`]: SQLite-backed, survives restart

pub mod memory;
pub mod sqlite;
pub mod traits;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;
pub use traits::{KvStore, StorageError};

/// Load and decode a JSON value stored under `key`.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::corrupt(key, e)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it under `key`.
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|e| StorageError::corrupt(key, e))?;
    store.set(key, &raw).await
}
