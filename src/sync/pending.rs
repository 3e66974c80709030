use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::{ChangeAction, EntityType, PendingChange};
use crate::storage::{load_json, save_json, KvStore, StorageError};

const PENDING_KEY: &str = "sync:pending";

/// Durable, ordered log of local changes awaiting push.
///
/// Holds at most one change per `(entity_type, entity_id)`. Recording a
/// change for an entity already in the log replaces the old one and moves
/// it to the tail, so push order follows the latest write. A `Create`
/// followed by an `Update` stays a `Create`, since the remote has still
/// never seen the record.
pub struct PendingChangeLog {
    store: Arc<dyn KvStore>,
    changes: Mutex<Vec<PendingChange>>,
}

impl PendingChangeLog {
    pub async fn load(store: Arc<dyn KvStore>) -> Result<Self, StorageError> {
        let changes = load_json::<Vec<PendingChange>>(store.as_ref(), PENDING_KEY)
            .await?
            .unwrap_or_default();
        Ok(Self {
            store,
            changes: Mutex::new(changes),
        })
    }

    /// Record the latest intent for one entity.
    pub async fn record(
        &self,
        entity_type: EntityType,
        action: ChangeAction,
        entity_id: &str,
        now_ms: i64,
    ) -> Result<PendingChange, StorageError> {
        let mut changes = self.changes.lock().await;

        let action = match changes.iter().position(|c| c.is_for(entity_type, entity_id)) {
            Some(pos) => {
                let previous = changes.remove(pos);
                debug!(
                    entity = %entity_type,
                    id = entity_id,
                    previous = ?previous.action,
                    next = ?action,
                    "Pending change superseded"
                );
                match (previous.action, action) {
                    (ChangeAction::Create, ChangeAction::Update) => ChangeAction::Create,
                    (_, next) => next,
                }
            }
            None => action,
        };

        let change = PendingChange {
            entity_type,
            action,
            entity_id: entity_id.to_string(),
            queued_at: now_ms,
        };
        changes.push(change.clone());
        self.persist(&changes).await?;
        Ok(change)
    }

    /// Remove `change` once the remote accepted it. A change superseded
    /// while it was in flight is left in place.
    pub async fn complete(&self, change: &PendingChange) -> Result<bool, StorageError> {
        let mut changes = self.changes.lock().await;
        let Some(pos) = changes.iter().position(|c| c == change) else {
            return Ok(false);
        };
        changes.remove(pos);
        self.persist(&changes).await?;
        Ok(true)
    }

    /// Drop whatever change is pending for the entity.
    pub async fn discard(&self, entity_type: EntityType, entity_id: &str) -> Result<bool, StorageError> {
        let mut changes = self.changes.lock().await;
        let before = changes.len();
        changes.retain(|c| !c.is_for(entity_type, entity_id));
        if changes.len() == before {
            return Ok(false);
        }
        self.persist(&changes).await?;
        Ok(true)
    }

    pub async fn get(&self, entity_type: EntityType, entity_id: &str) -> Option<PendingChange> {
        self.changes
            .lock()
            .await
            .iter()
            .find(|c| c.is_for(entity_type, entity_id))
            .cloned()
    }

    /// All changes in push order.
    pub async fn snapshot(&self) -> Vec<PendingChange> {
        self.changes.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.changes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.changes.lock().await.is_empty()
    }

    async fn persist(&self, changes: &[PendingChange]) -> Result<(), StorageError> {
        crate::metrics::set_pending_changes(changes.len());
        save_json(self.store.as_ref(), PENDING_KEY, changes).await
    }
}
