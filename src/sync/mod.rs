//! Bidirectional reconciliation between the local replica and the remote store.
//!
//! # Architecture
//!
//! ```text
//!  save_local / delete_local
//!          │
//!          ▼
//!   LocalStore ──► PendingChangeLog ("sync:pending")
//!                          │ push (change order)
//!                          ▼
//!           RateLimiter ─► CircuitBreaker ─► RemoteStore
//!                          ▲
//!                          │ pull (per-record last-write-wins)
//!   LocalStore ◄───────────┘
//! ```
//!
//! `full_sync` pulls first so a newer remote edit is adopted before the
//! local push could overwrite it, then pushes whatever local intent is
//! left. Entries merge by `updated_at` with a clock-skew tolerance;
//! settings take the remote copy unless a local settings change is still
//! pending.

mod engine;
mod memory;
mod pending;
mod stores;
mod types;

pub use engine::SyncEngine;
pub use memory::MemoryRecordStore;
pub use pending::PendingChangeLog;
pub use stores::{LocalStore, RemoteStore};
pub use types::{
    ChangeAction, EntityType, PendingChange, Record, SyncCursor, SyncReport, SyncStatus,
};

use std::time::Duration;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Offline, sync skipped")]
    Offline,
    #[error("A sync is already running")]
    AlreadyRunning,
    #[error("Sync storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A remote version must be newer than the local one by more than this
    /// to replace it. A heuristic for clock drift, not a guarantee.
    pub clock_skew_tolerance: Duration,
    /// Periodic full sync; `None` syncs only on reconnect
    pub auto_sync_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(1),
            auto_sync_interval: Some(Duration::from_secs(300)),
        }
    }
}
