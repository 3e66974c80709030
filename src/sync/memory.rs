use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::stores::{LocalStore, RemoteStore};
use super::types::{EntityType, Record};
use crate::error::CallError;
use crate::storage::StorageError;

/// In-memory record store usable as either replica.
///
/// Used for tests and ephemeral sessions. Remote-side writes are upserts
/// and counted, so callers can assert on round-trips.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<(EntityType, String), Record>,
    remote_writes: AtomicU64,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing write counting.
    pub fn insert(&self, entity_type: EntityType, record: Record) {
        self.records.insert((entity_type, record.id.clone()), record);
    }

    #[must_use]
    pub fn record(&self, entity_type: EntityType, id: &str) -> Option<Record> {
        self.records
            .get(&(entity_type, id.to_string()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn count(&self, entity_type: EntityType) -> usize {
        self.records.iter().filter(|r| r.key().0 == entity_type).count()
    }

    /// Writes received through [`RemoteStore`].
    #[must_use]
    pub fn remote_writes(&self) -> u64 {
        self.remote_writes.load(Ordering::Relaxed)
    }

    fn sorted(&self, entity_type: EntityType) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.key().0 == entity_type)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[async_trait]
impl LocalStore for MemoryRecordStore {
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>, StorageError> {
        Ok(self.sorted(entity_type))
    }

    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>, StorageError> {
        Ok(self.record(entity_type, id))
    }

    async fn put(&self, entity_type: EntityType, record: Record) -> Result<(), StorageError> {
        self.insert(entity_type, record);
        Ok(())
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), StorageError> {
        self.records.remove(&(entity_type, id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRecordStore {
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>, CallError> {
        Ok(self.sorted(entity_type))
    }

    async fn create(&self, entity_type: EntityType, record: &Record) -> Result<(), CallError> {
        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.insert(entity_type, record.clone());
        Ok(())
    }

    async fn update(&self, entity_type: EntityType, record: &Record) -> Result<(), CallError> {
        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.insert(entity_type, record.clone());
        Ok(())
    }

    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), CallError> {
        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.records.remove(&(entity_type, id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_and_remote_views_share_records() {
        let store = MemoryRecordStore::new();
        RemoteStore::create(&store, EntityType::Entry, &Record::new("b", 2, json!({}))).await.unwrap();
        LocalStore::put(&store, EntityType::Entry, Record::new("a", 1, json!({}))).await.unwrap();
        LocalStore::put(&store, EntityType::Settings, Record::new("prefs", 1, json!({}))).await.unwrap();

        let ids: Vec<String> = LocalStore::list(&store, EntityType::Entry)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.count(EntityType::Settings), 1);
        assert_eq!(store.remote_writes(), 1);

        RemoteStore::delete(&store, EntityType::Entry, "missing").await.unwrap();
        assert_eq!(store.count(EntityType::Entry), 2);
    }
}
