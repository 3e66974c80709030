use async_trait::async_trait;
use dashmap::DashMap;
use super::traits::{KvStore, StorageError};

/// Process-local [`KvStore`]. Nothing survives a restart; used for tests
/// and ephemeral sessions.
pub struct MemoryKvStore {
    data: DashMap<String, String>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current key count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryKvStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryKvStore::new();
        store.set("cache:mood", "\"calm\"").await.unwrap();

        let value = store.get("cache:mood").await.unwrap();
        assert_eq!(value.as_deref(), Some("\"calm\""));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_ok() {
        let store = MemoryKvStore::new();
        assert!(store.delete("nonexistent").await.is_ok());
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let store = MemoryKvStore::new();
        store.set("k", "1").await.unwrap();
        store.set("k", "2").await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_keys_with_prefix_sorted() {
        let store = MemoryKvStore::new();
        for key in ["cache:b", "cache:a", "ratelimit:ai", "cache:c"] {
            store.set(key, "x").await.unwrap();
        }

        let keys = store.keys_with_prefix("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:a", "cache:b", "cache:c"]);
    }

    #[tokio::test]
    async fn test_delete_batch_via_trait() {
        let store = MemoryKvStore::new();
        for i in 0..5 {
            store.set(&format!("k{}", i), "v").await.unwrap();
        }

        let keys: Vec<String> = (0..3).map(|i| format!("k{}", i)).collect();
        let deleted = store.delete_batch(&keys).await.unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store = Arc::new(MemoryKvStore::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let store_clone = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store_clone
                        .set(&format!("batch-{}-key-{}", batch, i), "v")
                        .await
                        .unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
