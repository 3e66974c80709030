//! Process-wide wiring of the resilience components.
//!
//! Owns one instance of each singleton concern (cache, the AI and
//! remote-store limiters, circuit registry, offline queue) over a shared
//! durable store, so a host constructs everything once and hands out handles.

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::TieredCache;
use crate::clock::SharedClock;
use crate::config::ResilienceConfig;
use crate::connectivity::Connectivity;
use crate::offline::{HandlerRegistry, OfflineQueue, QueueError};
use crate::pipeline::ResilientCaller;
use crate::resilience::{CircuitBreaker, CircuitRegistry, RateLimiter};
use crate::storage::{KvStore, MemoryKvStore, SqliteKvStore, StorageError};
use crate::sync::{LocalStore, RemoteStore, SyncEngine, SyncError};

/// Name shared by the AI limiter, breaker and offline queue.
pub const AI_RESOURCE: &str = "ai";
/// Name shared by the remote-store limiter and breaker.
pub const REMOTE_STORE_RESOURCE: &str = "remote_store";

#[derive(Error, Debug)]
pub enum SubsystemError {
    #[error("Storage unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error("Offline queue unavailable: {0}")]
    Queue(#[from] QueueError),
    #[error("Sync engine unavailable: {0}")]
    Sync(#[from] SyncError),
}

pub struct Subsystem {
    config: ResilienceConfig,
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    connectivity: Connectivity,
    cache: Arc<TieredCache>,
    ai_limiter: Arc<RateLimiter>,
    remote_limiter: Arc<RateLimiter>,
    circuits: CircuitRegistry,
    queue: Arc<OfflineQueue>,
    handlers: Arc<HandlerRegistry>,
}

impl Subsystem {
    /// Open the durable store named by `config.store_path` (memory when
    /// unset) and build every component over it.
    pub async fn open(
        config: ResilienceConfig,
        handlers: Arc<HandlerRegistry>,
        connectivity: Connectivity,
        clock: SharedClock,
    ) -> Result<Self, SubsystemError> {
        let store: Arc<dyn KvStore> = match &config.store_path {
            Some(path) => Arc::new(SqliteKvStore::open(path).await?),
            None => Arc::new(MemoryKvStore::new()),
        };
        Self::with_store(config, store, handlers, connectivity, clock).await
    }

    /// Build every component over an existing store.
    pub async fn with_store(
        config: ResilienceConfig,
        store: Arc<dyn KvStore>,
        handlers: Arc<HandlerRegistry>,
        connectivity: Connectivity,
        clock: SharedClock,
    ) -> Result<Self, SubsystemError> {
        let cache = Arc::new(TieredCache::new(config.cache_config(), store.clone(), clock.clone()));

        let ai_limiter = Arc::new(RateLimiter::new(
            AI_RESOURCE,
            config.rate_limit_config(),
            store.clone(),
            clock.clone(),
        ));
        ai_limiter.restore().await;

        let remote_limiter = Arc::new(RateLimiter::new(
            REMOTE_STORE_RESOURCE,
            config.rate_limit_config(),
            store.clone(),
            clock.clone(),
        ));
        remote_limiter.restore().await;

        let circuits = CircuitRegistry::new(config.circuit_config(), clock.clone());

        let queue = Arc::new(
            OfflineQueue::open(
                AI_RESOURCE,
                config.offline_queue_config(),
                store.clone(),
                handlers.clone(),
                connectivity.clone(),
                clock.clone(),
            )
            .await?,
        );

        info!(
            durable = config.store_path.is_some(),
            online = connectivity.is_online(),
            "Resilience subsystem ready"
        );

        Ok(Self {
            config,
            store,
            clock,
            connectivity,
            cache,
            ai_limiter,
            remote_limiter,
            circuits,
            queue,
            handlers,
        })
    }

    /// Spawn the cache sweeper and the offline drain loop.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.cache.spawn_sweeper(shutdown.clone()),
            self.queue.spawn(shutdown),
        ]
    }

    /// The protected path for AI calls.
    #[must_use]
    pub fn caller(&self) -> ResilientCaller {
        ResilientCaller::new(
            self.cache.clone(),
            self.ai_limiter.clone(),
            self.ai_breaker(),
            self.queue.clone(),
            self.connectivity.clone(),
        )
    }

    #[must_use]
    pub fn ai_breaker(&self) -> Arc<CircuitBreaker> {
        self.circuits.get_or_create(AI_RESOURCE)
    }

    /// A sync engine whose remote calls go through the remote-store limiter
    /// and breaker. Every engine built here shares the same pair.
    pub async fn sync_engine(
        &self,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<SyncEngine>, SubsystemError> {
        let engine = SyncEngine::open(
            self.config.sync_config(),
            local,
            remote,
            self.store.clone(),
            self.remote_limiter.clone(),
            self.circuits.get_or_create(REMOTE_STORE_RESOURCE),
            self.connectivity.clone(),
            self.clock.clone(),
        )
        .await?;
        Ok(Arc::new(engine))
    }

    #[must_use]
    pub fn ai_limiter(&self) -> &Arc<RateLimiter> {
        &self.ai_limiter
    }

    #[must_use]
    pub fn remote_store_limiter(&self) -> &Arc<RateLimiter> {
        &self.remote_limiter
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    #[must_use]
    pub fn offline_queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    #[must_use]
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    #[must_use]
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    #[must_use]
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}
