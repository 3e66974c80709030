// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The protected request path for one upstream (AI) call.
//!
//! ```text
//! call(request)
//!   │
//!   ├─ cache hit ─────────────────────────────► Cached(value)
//!   │
//!   ├─ offline ───────────────────────────────► Queued { operation_id }
//!   │
//!   └─ RateLimiter ─► CircuitBreaker ─► upstream
//!                                         │
//!                      ok ── cache.set ───┴──► Fresh(value)
//!                      Transient/BreakerOpen ─► Queued { operation_id }
//!                      anything else ─────────► Err
//! ```
//!
//! A queued request replays later through the offline queue handler named
//! in [`CachedRequest::handler_name`]; the caller only gets the id.
//! Concurrent calls for one cache key share a single upstream attempt, so
//! they also share a single queued operation.

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::TieredCache;
use crate::connectivity::Connectivity;
use crate::error::CallError;
use crate::offline::{OfflineQueue, QueueError};
use crate::resilience::{CircuitBreaker, RateLimiter};

/// Describes one cacheable upstream call and how to replay it offline.
#[derive(Debug, Clone)]
pub struct CachedRequest {
    pub cache_key: String,
    /// `None` uses the cache default
    pub ttl: Option<Duration>,
    pub priority: i32,
    /// Operation kind recorded on the queued item
    pub kind: String,
    pub handler_name: String,
    /// Everything the handler needs to redo the call
    pub payload: Value,
}

impl CachedRequest {
    pub fn new(cache_key: impl Into<String>, handler_name: impl Into<String>, payload: Value) -> Self {
        let handler_name = handler_name.into();
        Self {
            cache_key: cache_key.into(),
            ttl: None,
            priority: 0,
            kind: handler_name.clone(),
            handler_name,
            payload,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// Served from the cache (including a value another caller just fetched)
    Cached(Value),
    /// Fetched from upstream by this call and cached
    Fresh(Value),
    /// Deferred to the offline queue
    Queued { operation_id: String },
}

impl CallOutcome {
    /// The value, if the call produced one now.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Cached(v) | Self::Fresh(v) => Some(v),
            Self::Queued { .. } => None,
        }
    }

    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

/// How a flight of same-key calls ended without a value.
#[derive(Debug, Clone)]
enum Unfetched {
    Failed(CallError),
    Deferred { operation_id: String },
    Unqueued(QueueError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("request could not be queued: {0}")]
    Queue(#[from] QueueError),
}

/// Cache, limiter, breaker and offline queue composed for one upstream.
#[derive(Clone)]
pub struct ResilientCaller {
    cache: Arc<TieredCache>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<OfflineQueue>,
    connectivity: Connectivity,
}

impl ResilientCaller {
    pub fn new(
        cache: Arc<TieredCache>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        queue: Arc<OfflineQueue>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            cache,
            limiter,
            breaker,
            queue,
            connectivity,
        }
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run `request` through the protected path.
    ///
    /// `upstream` may be invoked more than once when the limiter retries a
    /// quota rejection.
    pub async fn call<F, Fut>(&self, request: &CachedRequest, upstream: F) -> Result<CallOutcome, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, CallError>>,
    {
        if !self.connectivity.is_online() {
            if let Some(value) = self.cache.get(&request.cache_key).await {
                return Ok(CallOutcome::Cached(value));
            }
            let operation_id = self.enqueue(request, "offline").await?;
            return Ok(CallOutcome::Queued { operation_id });
        }

        let fetched = AtomicBool::new(false);
        let result = {
            let fetched = &fetched;
            let limiter = &self.limiter;
            let breaker = &*self.breaker;
            let upstream = &upstream;
            self.cache
                .get_or_set(&request.cache_key, request.ttl, move || async move {
                    fetched.store(true, Ordering::Relaxed);
                    let attempt = limiter
                        .execute(request.priority, move || breaker.call(move || upstream()))
                        .await;
                    match attempt {
                        Ok(value) => Ok(value),
                        Err(e) if e.should_queue_offline() => {
                            debug!(key = %request.cache_key, error = %e, "Upstream unavailable");
                            match self.enqueue(request, "upstream unavailable").await {
                                Ok(operation_id) => Err(Unfetched::Deferred { operation_id }),
                                Err(e) => Err(Unfetched::Unqueued(e)),
                            }
                        }
                        Err(e) => Err(Unfetched::Failed(e)),
                    }
                })
                .await
        };

        match result {
            Ok(value) if fetched.load(Ordering::Relaxed) => Ok(CallOutcome::Fresh(value)),
            Ok(value) => Ok(CallOutcome::Cached(value)),
            Err(Unfetched::Deferred { operation_id }) => Ok(CallOutcome::Queued { operation_id }),
            Err(Unfetched::Failed(e)) => Err(e.into()),
            Err(Unfetched::Unqueued(e)) => Err(e.into()),
        }
    }

    /// [`call`](Self::call) that gives up when `token` is cancelled.
    /// A cancelled call is neither cached nor queued.
    pub async fn call_cancellable<F, Fut>(
        &self,
        token: &CancellationToken,
        request: &CachedRequest,
        upstream: F,
    ) -> Result<CallOutcome, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, CallError>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CallError::Cancelled.into()),
            result = self.call(request, upstream) => result,
        }
    }

    async fn enqueue(&self, request: &CachedRequest, reason: &'static str) -> Result<String, QueueError> {
        let operation_id = self
            .queue
            .enqueue(request.kind.clone(), request.handler_name.clone(), request.payload.clone())
            .await?;
        info!(
            key = %request.cache_key,
            kind = %request.kind,
            id = %operation_id,
            reason,
            "Request deferred to offline queue"
        );
        Ok(operation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::{ManualClock, SharedClock};
    use crate::offline::{HandlerRegistry, OfflineQueueConfig};
    use crate::resilience::{CircuitConfig, CircuitState, RateLimitConfig};
    use crate::storage::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn caller(connectivity: Connectivity) -> (ResilientCaller, Arc<OfflineQueue>) {
        let clock: SharedClock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryKvStore::new());
        let cache = Arc::new(TieredCache::new(CacheConfig::default(), store.clone(), clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            "ai",
            RateLimitConfig { min_delay: Duration::ZERO, ..RateLimitConfig::default() },
            store.clone(),
            clock.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "ai",
            CircuitConfig { failure_threshold: 3, ..CircuitConfig::default() },
            clock.clone(),
        ));
        let queue = Arc::new(
            OfflineQueue::open(
                "ai",
                OfflineQueueConfig::default(),
                store,
                Arc::new(HandlerRegistry::new()),
                connectivity.clone(),
                clock,
            )
            .await
            .unwrap(),
        );
        (ResilientCaller::new(cache, limiter, breaker, queue.clone(), connectivity), queue)
    }

    fn request() -> CachedRequest {
        CachedRequest::new("insight:2026-10-14", "generate_insight", json!({ "day": "2026-10-14" }))
    }

    #[tokio::test]
    async fn test_fresh_then_cached() {
        let (caller, _) = caller(Connectivity::new(true)).await;
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let upstream = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "insight": "slept well" }))
        };

        let first = caller.call(&request(), upstream).await.unwrap();
        let second = caller.call(&request(), upstream).await.unwrap();

        assert!(matches!(first, CallOutcome::Fresh(_)));
        assert_eq!(second, CallOutcome::Cached(json!({ "insight": "slept well" })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_queued() {
        let (caller, queue) = caller(Connectivity::new(true)).await;

        let outcome = caller
            .call(&request(), || async { Err(CallError::transient("connection reset")) })
            .await
            .unwrap();

        let CallOutcome::Queued { operation_id } = outcome else {
            panic!("expected queued outcome");
        };
        let items = queue.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, operation_id);
        assert_eq!(items[0].handler_name, "generate_insight");
    }

    #[tokio::test]
    async fn test_same_key_failures_share_one_queued_operation() {
        let (caller, queue) = caller(Connectivity::new(true)).await;
        let calls = AtomicUsize::new(0);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let (calls, release_rx) = (&calls, &release_rx);
        let upstream = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.clone().wait_for(|go| *go).await;
            Err::<Value, _>(CallError::transient("connection reset"))
        };
        let request = request();

        let (outcomes, ()) = tokio::join!(
            futures::future::join_all((0..4).map(|_| caller.call(&request, upstream))),
            async {
                while calls.load(Ordering::SeqCst) == 0 {
                    tokio::task::yield_now().await;
                }
                release_tx.send(true).unwrap();
            }
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let items = queue.items().await;
        assert_eq!(items.len(), 1);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap(), CallOutcome::Queued { operation_id: items[0].id.clone() });
        }
    }

    #[tokio::test]
    async fn test_upstream_error_propagates() {
        let (caller, queue) = caller(Connectivity::new(true)).await;

        let err = caller
            .call(&request(), || async { Err(CallError::upstream("bad prompt")) })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Call(CallError::Upstream(_))));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_breaker_queues_without_calling() {
        let (caller, queue) = caller(Connectivity::new(true)).await;
        for _ in 0..3 {
            let _ = caller.call(&request(), || async { Err(CallError::upstream("500")) }).await;
        }
        assert_eq!(caller.breaker().state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let outcome = caller
            .call(&request(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .await
            .unwrap();

        assert!(outcome.is_queued());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_offline_skips_upstream() {
        let (caller, queue) = caller(Connectivity::new(false)).await;

        let outcome = caller
            .call(&request(), || async { Ok(json!("unreachable")) })
            .await
            .unwrap();

        assert!(outcome.is_queued());
        assert_eq!(outcome.value(), None);
        assert_eq!(queue.len().await, 1);
        assert_eq!(caller.limiter().usage().total_requests, 0);
    }
}
