use async_trait::async_trait;

use super::types::{EntityType, Record};
use crate::error::CallError;
use crate::storage::StorageError;

/// The local replica. Source of truth for writes not yet pushed.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>, StorageError>;
    async fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>, StorageError>;
    async fn put(&self, entity_type: EntityType, record: Record) -> Result<(), StorageError>;
    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), StorageError>;
}

/// The remote store. Calls are protected, so failures use [`CallError`].
///
/// Implementations should treat `create` of an existing id and `delete` of
/// a missing one as success: pushes are at-least-once.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, entity_type: EntityType) -> Result<Vec<Record>, CallError>;
    async fn create(&self, entity_type: EntityType, record: &Record) -> Result<(), CallError>;
    async fn update(&self, entity_type: EntityType, record: &Record) -> Result<(), CallError>;
    async fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), CallError>;
}
