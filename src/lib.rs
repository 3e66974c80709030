//! # Journal Sync
//!
//! Resilience and offline-sync subsystem for a wellness journal: keeps AI
//! calls within quota, stops hammering a failing upstream, survives being
//! offline, and reconciles local entries with a remote store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ResilientCaller                         │
//! │  • TieredCache: memory → durable KvStore, single-flight     │
//! │  • RateLimiter: minute/day/min-delay, priority tickets      │
//! │  • CircuitBreaker: Closed → Open → HalfOpen probe           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Transient / BreakerOpen
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      OfflineQueue                           │
//! │  • Named handler + JSON payload, persisted                  │
//! │  • FIFO replay on reconnect, maxRetries then drop (logged)  │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SyncEngine                            │
//! │  • PendingChangeLog: one change per entity, change order    │
//! │  • Pull (last-write-wins + skew tolerance), then push       │
//! │  • Remote calls through their own limiter and breaker       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every component persists through one [`KvStore`] (SQLite or memory) and
//! reads time from a [`Clock`], so tests drive them with a manual clock or
//! paused tokio time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use journal_sync::{
//!     CachedRequest, CallError, Connectivity, HandlerRegistry, ResilienceConfig, Subsystem,
//!     SystemClock,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ResilienceConfig {
//!         store_path: Some("journal.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let handlers = Arc::new(HandlerRegistry::new());
//!     handlers.register_fn("generate_insight", |op| async move {
//!         println!("replaying {}", op.payload);
//!         Ok::<_, CallError>(())
//!     });
//!
//!     let subsystem = Subsystem::open(config, handlers, Connectivity::default(), SystemClock::shared()).await?;
//!     let shutdown = CancellationToken::new();
//!     let _tasks = subsystem.start(shutdown.clone());
//!
//!     let request = CachedRequest::new("insight:today", "generate_insight", json!({ "day": "today" }));
//!     let outcome = subsystem
//!         .caller()
//!         .call(&request, || async { Ok(json!({ "insight": "rest more" })) })
//!         .await?;
//!     println!("{outcome:?}");
//!
//!     shutdown.cancel();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cache`]: two-tier cache with TTL, sweep and single-flight `get_or_set`
//! - [`resilience`]: rate limiter, circuit breaker, retry backoff
//! - [`offline`]: durable replay queue and handler registry
//! - [`sync`]: pending-change log and last-write-wins sync engine
//! - [`pipeline`]: cache → limiter → breaker → offline queue for one call
//! - [`storage`]: durable key-value stores
//! - [`subsystem`]: process-wide wiring

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod metrics;
pub mod offline;
pub mod pipeline;
pub mod resilience;
pub mod storage;
pub mod subsystem;
pub mod sync;

pub use cache::{CacheConfig, CacheEvent, CacheOutcome, CacheStats, TieredCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::ResilienceConfig;
pub use connectivity::Connectivity;
pub use error::CallError;
pub use metrics::LatencyTimer;
pub use offline::{
    DrainOutcome, DrainReport, HandlerRegistry, OfflineQueue, OfflineQueueConfig,
    OperationHandler, QueueError, QueuedOperation,
};
pub use pipeline::{CallOutcome, CachedRequest, PipelineError, ResilientCaller};
pub use resilience::{
    CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitSnapshot, CircuitState,
    RateLimitConfig, RateLimiter, RateLimiterUsage, RetryConfig,
};
pub use storage::{KvStore, MemoryKvStore, SqliteKvStore, StorageError};
pub use subsystem::{Subsystem, SubsystemError};
pub use sync::{
    ChangeAction, EntityType, LocalStore, MemoryRecordStore, PendingChange, Record,
    RemoteStore, SyncConfig, SyncCursor, SyncEngine, SyncError, SyncReport, SyncStatus,
};
