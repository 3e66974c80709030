//! Durable replay queue for operations that could not complete.
//!
//! Items carry a handler name and a JSON payload, never a closure, so the
//! whole queue can be persisted as one document under
//! `offline_queue:<name>` and replayed after a restart. Replay is strict
//! FIFO and at-least-once: a crash between a handler succeeding and the
//! item being removed replays it again, so handlers must be idempotent.

mod handler;
mod queue;

pub use handler::{HandlerRegistry, OperationHandler};
pub use queue::OfflineQueue;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Offline queue storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Payload for '{kind}' could not be serialized: {message}")]
    InvalidPayload { kind: String, message: String },
}

#[derive(Debug, Clone)]
pub struct OfflineQueueConfig {
    /// Oldest items are evicted to admit new ones past this size
    pub max_size: usize,
    /// Failed replays before an item is dropped as a permanent failure
    pub max_retries: u32,
    /// Periodic drain interval while online
    pub retry_interval: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_retries: 3,
            retry_interval: Duration::from_secs(30),
        }
    }
}

/// One deferred operation, owned by the queue until replayed or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub kind: String,
    pub handler_name: String,
    pub payload: Value,
    pub created_at: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    /// Failed but kept for another attempt
    pub failed: usize,
    /// Exceeded `max_retries` and removed
    pub dropped: usize,
    pub remaining: usize,
}

/// Per-item result of a drain, or an eviction on enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Replayed { id: String, kind: String },
    Failed { id: String, kind: String, retry_count: u32, error: String },
    PermanentFailure { id: String, kind: String, retry_count: u32, error: String },
    Evicted { id: String, kind: String },
}

impl DrainOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Replayed { .. } => "replayed",
            Self::Failed { .. } => "failed",
            Self::PermanentFailure { .. } => "permanent_failure",
            Self::Evicted { .. } => "evicted",
        }
    }
}

/// Observer for drain outcomes. Informational only.
pub type DrainHook = Arc<dyn Fn(&DrainOutcome) + Send + Sync>;
