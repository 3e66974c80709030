// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::memory::MemoryTier;
use super::{CacheConfig, CacheEntry, CacheEvent, CacheHook, CacheOutcome, CacheStats};
use crate::clock::SharedClock;
use crate::error::CallError;
use crate::metrics::LatencyTimer;
use crate::storage::{KvStore, StorageError};

const DURABLE_PREFIX: &str = "cache:";

fn durable_key(key: &str) -> String {
    format!("{}{}", DURABLE_PREFIX, key)
}

/// The leader's `Result<Value, E>`, shared with every caller of the flight.
type Landed = Arc<dyn Any + Send + Sync>;

enum Flight {
    Leader(watch::Sender<Option<Landed>>),
    Follower(watch::Receiver<Option<Landed>>),
}

pub struct TieredCache {
    config: CacheConfig,
    memory: MemoryTier,
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    /// Keys with a fetch in progress, and where its result will land
    inflight: Mutex<HashMap<String, watch::Receiver<Option<Landed>>>>,
    on_event: Option<CacheHook>,
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    pub fn new(config: CacheConfig, store: Arc<dyn KvStore>, clock: SharedClock) -> Self {
        let memory = MemoryTier::new(config.memory_max_entries);
        Self {
            config,
            memory,
            store,
            clock,
            inflight: Mutex::new(HashMap::new()),
            on_event: None,
            memory_hits: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Attach a lookup observer.
    #[must_use]
    pub fn with_event_hook(mut self, hook: CacheHook) -> Self {
        self.on_event = Some(hook);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`, promoting a durable hit into memory.
    ///
    /// Never fails: an unreadable durable tier is logged and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.lookup(key, true).await
    }

    async fn lookup(&self, key: &str, report_miss: bool) -> Option<Value> {
        let now = self.clock.now_ms();

        if let Some(entry) = self.memory.get(key) {
            if !entry.is_expired(now) {
                self.report(key, CacheOutcome::MemoryHit);
                return Some(entry.data);
            }
            self.memory.remove(key);
            self.purge_durable(key).await;
            self.report(key, CacheOutcome::Expired);
            return None;
        }

        let _timer = LatencyTimer::new("cache", "durable_get");
        let raw = match self.store.get(&durable_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                if report_miss {
                    self.report(key, CacheOutcome::Miss);
                }
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "Durable cache tier unavailable, treating as miss");
                if report_miss {
                    self.report(key, CacheOutcome::Miss);
                }
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupt cache entry");
                self.purge_durable(key).await;
                if report_miss {
                    self.report(key, CacheOutcome::Miss);
                }
                return None;
            }
        };

        if entry.is_expired(now) {
            self.purge_durable(key).await;
            self.report(key, CacheOutcome::Expired);
            return None;
        }

        let data = entry.data.clone();
        self.insert_memory(key, entry);
        self.report(key, CacheOutcome::DurableHit);
        Some(data)
    }

    /// Typed [`get`](Self::get). A value that no longer fits `T` is a miss.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(key, error = %e, "Cached value has unexpected shape");
                None
            }
        }
    }

    /// Write `value` through both tiers. `ttl` defaults to the configured
    /// TTL; a zero TTL skips caching entirely.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StorageError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            debug!(key, "Zero TTL, value not cached");
            return Ok(());
        }

        let entry = CacheEntry::new(value, self.clock.now_ms(), ttl);
        let raw = serde_json::to_string(&entry).map_err(|e| StorageError::corrupt(key, e))?;
        self.store.set(&durable_key(key), &raw).await?;
        self.insert_memory(key, entry);
        Ok(())
    }

    /// Typed [`set`](Self::set).
    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|e| StorageError::corrupt(key, e))?;
        self.set(key, value, ttl).await
    }

    /// Return the cached value or run `fetcher` and cache its result.
    ///
    /// Concurrent misses for the same key share one fetch: the first caller
    /// runs `fetcher` and every caller that joined meanwhile receives a clone
    /// of its result, error included. This holds when the value is not
    /// cached (zero TTL, durable write failure). If the leader is dropped
    /// mid-fetch one of the waiters takes over.
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, ttl: Option<Duration>, fetcher: F) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Clone + Send + Sync + 'static,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        loop {
            match self.join_flight(key) {
                Flight::Follower(mut landing) => {
                    let landed = match landing.wait_for(Option::is_some).await {
                        Ok(landed) => (*landed).clone(),
                        Err(_) => None,
                    };
                    let shared = landed
                        .as_deref()
                        .and_then(|any| any.downcast_ref::<Result<Value, E>>());
                    if let Some(result) = shared {
                        return result.clone();
                    }
                    // Leader gave up or used another error type
                    if let Some(value) = self.lookup(key, false).await {
                        return Ok(value);
                    }
                }
                Flight::Leader(landing) => {
                    let _exit = FlightExit { cache: self, key };

                    // Filled between our miss and taking the lead
                    let result = match self.lookup(key, false).await {
                        Some(value) => Ok(value),
                        None => {
                            let result = fetcher().await;
                            if let Ok(value) = &result {
                                self.store_fetched(key, value.clone(), ttl).await;
                            }
                            result
                        }
                    };
                    let landed: Landed = Arc::new(result.clone());
                    landing.send_replace(Some(landed));
                    return result;
                }
            }
        }
    }

    /// Cache a fetched value, keeping it in memory when the durable tier
    /// rejects the write.
    async fn store_fetched(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let Err(e) = self.set(key, value.clone(), ttl).await else {
            return;
        };
        warn!(key, error = %e, "Fetched value cached in memory only");
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if !ttl.is_zero() {
            self.insert_memory(key, CacheEntry::new(value, self.clock.now_ms(), ttl));
        }
    }

    /// [`get_or_set`](Self::get_or_set) that gives up when `token` is
    /// cancelled. Nothing is cached for a cancelled fetch.
    pub async fn get_or_set_cancellable<F, Fut>(
        &self,
        token: &CancellationToken,
        key: &str,
        ttl: Option<Duration>,
        fetcher: F,
    ) -> Result<Value, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, CallError>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CallError::Cancelled),
            result = self.get_or_set(key, ttl, fetcher) => result,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.memory.remove(key);
        crate::metrics::set_cache_memory_entries(self.memory.len());
        self.store.delete(&durable_key(key)).await
    }

    /// Drop every entry from both tiers.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.memory.clear();
        crate::metrics::set_cache_memory_entries(0);
        let keys = self.store.keys_with_prefix(DURABLE_PREFIX).await?;
        let removed = self.store.delete_batch(&keys).await?;
        info!(removed, "Cache cleared");
        Ok(())
    }

    /// Drop every entry whose key starts with `prefix`. Returns how many
    /// keys were removed.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let from_memory = self.memory.remove_prefix(prefix);
        crate::metrics::set_cache_memory_entries(self.memory.len());

        let keys = self.store.keys_with_prefix(&durable_key(prefix)).await?;
        let from_durable = self.store.delete_batch(&keys).await?;

        let removed = from_memory.max(from_durable);
        crate::metrics::record_cache_removed("invalidated", removed);
        debug!(prefix, removed, "Cache prefix invalidated");
        Ok(removed)
    }

    /// Purge expired entries from both tiers. Returns the number of
    /// durable entries removed.
    pub async fn sweep_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now_ms();
        let from_memory = self.memory.remove_expired(now);

        let mut stale = Vec::new();
        for key in self.store.keys_with_prefix(DURABLE_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let expired = serde_json::from_str::<CacheEntry>(&raw)
                .map(|entry| entry.is_expired(now))
                .unwrap_or(true);
            if expired {
                stale.push(key);
            }
        }
        let removed = self.store.delete_batch(&stale).await?;

        crate::metrics::set_cache_memory_entries(self.memory.len());
        crate::metrics::record_cache_removed("expired", removed);
        if removed > 0 || from_memory > 0 {
            debug!(durable = removed, memory = from_memory, "Expired cache entries swept");
        }
        Ok(removed)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval`
    /// until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cache.sweep_expired().await {
                            warn!(error = %e, "Cache sweep failed");
                        }
                    }
                }
            }
        })
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries: self.memory.len(),
        }
    }

    fn insert_memory(&self, key: &str, entry: CacheEntry) {
        let evicted = self.memory.insert(key, entry);
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Memory tier evicted oldest entries");
            crate::metrics::record_cache_removed("evicted", evicted.len());
        }
        crate::metrics::set_cache_memory_entries(self.memory.len());
    }

    async fn purge_durable(&self, key: &str) {
        if let Err(e) = self.store.delete(&durable_key(key)).await {
            warn!(key, error = %e, "Failed to purge durable cache entry");
        }
    }

    fn report(&self, key: &str, outcome: CacheOutcome) {
        let (tier, label) = match outcome {
            CacheOutcome::MemoryHit => {
                self.memory_hits.fetch_add(1, Ordering::Relaxed);
                ("memory", "hit")
            }
            CacheOutcome::DurableHit => {
                self.durable_hits.fetch_add(1, Ordering::Relaxed);
                ("durable", "hit")
            }
            CacheOutcome::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                ("durable", "miss")
            }
            CacheOutcome::Expired => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                ("durable", "expired")
            }
        };
        crate::metrics::record_cache_lookup(tier, label);

        if let Some(hook) = &self.on_event {
            hook(&CacheEvent {
                key: key.to_string(),
                outcome,
            });
        }
    }

    fn join_flight(&self, key: &str) -> Flight {
        let mut inflight = self.inflight.lock();
        if let Some(landing) = inflight.get(key) {
            return Flight::Follower(landing.clone());
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx);
        Flight::Leader(tx)
    }
}

/// Ends the leader's flight, including when the leader is dropped.
struct FlightExit<'a> {
    cache: &'a TieredCache,
    key: &'a str,
}

impl Drop for FlightExit<'_> {
    fn drop(&mut self) {
        self.cache.inflight.lock().remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn cache(max_entries: usize) -> (Arc<TieredCache>, Arc<MemoryKvStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryKvStore::new());
        let clock = ManualClock::new(1_000_000);
        let config = CacheConfig {
            memory_max_entries: max_entries,
            ..CacheConfig::default()
        };
        let cache = Arc::new(TieredCache::new(config, store.clone(), clock.clone()));
        (cache, store, clock)
    }

    #[tokio::test]
    async fn test_get_after_set_until_ttl() {
        let (cache, _, clock) = cache(10);
        cache.set("insight:today", json!({"mood": "calm"}), Some(Duration::from_secs(60))).await.unwrap();

        assert_eq!(cache.get("insight:today").await, Some(json!({"mood": "calm"})));

        clock.advance(Duration::from_secs(59));
        assert!(cache.get("insight:today").await.is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get("insight:today").await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_cached() {
        let (cache, store, _) = cache(10);
        cache.set("k", json!(1), Some(Duration::ZERO)).await.unwrap();

        assert!(cache.get("k").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_durable_hit_promotes_into_memory() {
        let (cache, store, clock) = cache(10);
        cache.set("k", json!("v"), None).await.unwrap();

        // Fresh instance over the same store: memory tier starts empty
        let reopened = TieredCache::new(CacheConfig::default(), store.clone(), clock);
        assert_eq!(reopened.get("k").await, Some(json!("v")));
        assert_eq!(reopened.get("k").await, Some(json!("v")));

        let stats = reopened.stats();
        assert_eq!(stats.durable_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.memory_entries, 1);
    }

    #[tokio::test]
    async fn test_memory_eviction_falls_back_to_durable() {
        let (cache, _, _) = cache(2);
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            cache.set(key, json!(i), None).await.unwrap();
        }

        assert_eq!(cache.stats().memory_entries, 2);
        assert_eq!(cache.get("a").await, Some(json!(0)));
        assert_eq!(cache.stats().durable_hits, 1);
    }

    #[tokio::test]
    async fn test_expired_durable_entry_is_purged_on_read() {
        let (cache, store, clock) = cache(10);
        cache.set("k", json!(1), Some(Duration::from_secs(5))).await.unwrap();
        let reopened = TieredCache::new(CacheConfig::default(), store.clone(), clock.clone());

        clock.advance(Duration::from_secs(6));

        assert!(reopened.get("k").await.is_none());
        assert!(store.get("cache:k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_durable_entry_is_a_miss() {
        let (cache, store, _) = cache(10);
        store.set("cache:broken", "{ not json").await.unwrap();

        assert!(cache.get("broken").await.is_none());
        assert!(store.get("cache:broken").await.unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Insight {
            summary: String,
            score: u8,
        }

        let (cache, _, _) = cache(10);
        let insight = Insight { summary: "steady week".into(), score: 7 };
        cache.set_as("insight:w1", &insight, None).await.unwrap();

        assert_eq!(cache.get_as::<Insight>("insight:w1").await, Some(insight));
        assert_eq!(cache.get_as::<Vec<u8>>("insight:w1").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_by_prefix_and_clear() {
        let (cache, store, _) = cache(10);
        cache.set("insight:1", json!(1), None).await.unwrap();
        cache.set("insight:2", json!(2), None).await.unwrap();
        cache.set("face:1", json!(3), None).await.unwrap();
        store.set("ratelimit:ai", "{}").await.unwrap();

        assert_eq!(cache.invalidate_by_prefix("insight:").await.unwrap(), 2);
        assert!(cache.get("insight:1").await.is_none());
        assert!(cache.get("face:1").await.is_some());

        cache.clear().await.unwrap();
        assert!(cache.get("face:1").await.is_none());
        // Other namespaces in the shared store are untouched
        assert!(store.get("ratelimit:ai").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (cache, store, clock) = cache(10);
        cache.set("short", json!(1), Some(Duration::from_secs(1))).await.unwrap();
        cache.set("long", json!(2), Some(Duration::from_secs(600))).await.unwrap();
        store.set("cache:garbage", "???").await.unwrap();

        clock.advance(Duration::from_secs(2));
        let removed = cache.sweep_expired().await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(store.keys_with_prefix("cache:").await.unwrap(), vec!["cache:long"]);
        assert_eq!(cache.stats().memory_entries, 1);
    }

    #[tokio::test]
    async fn test_get_or_set_single_flight() {
        let (cache, _, _) = cache(10);
        let fetches = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            let mut release_rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set("insight:shared", None, || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.wait_for(|go| *go).await;
                        Ok::<_, CallError>(json!("computed"))
                    })
                    .await
            }));
        }

        // Let every task reach the flight lock before the fetch completes
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        release_tx.send(true).unwrap();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), json!("computed"));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(cache.inflight.lock().is_empty());
    }

    /// `callers` concurrent `get_or_set` calls on one key, released together.
    async fn race_get_or_set(
        cache: &Arc<TieredCache>,
        callers: usize,
        ttl: Option<Duration>,
        outcome: Result<Value, CallError>,
    ) -> (Vec<Result<Value, CallError>>, usize) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..callers {
            let cache = cache.clone();
            let fetches = fetches.clone();
            let outcome = outcome.clone();
            let mut release_rx = release_rx.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_set("insight:shared", ttl, || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.wait_for(|go| *go).await;
                        outcome
                    })
                    .await
            }));
        }

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        release_tx.send(true).unwrap();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        (results, fetches.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_zero_ttl_get_or_set_still_fetches_once() {
        let (cache, store, _) = cache(10);

        let (results, fetches) = race_get_or_set(&cache, 8, Some(Duration::ZERO), Ok(json!("live"))).await;

        assert_eq!(fetches, 1);
        assert!(results.iter().all(|r| *r == Ok(json!("live"))));
        assert!(store.is_empty());
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_is_shared_with_waiters() {
        let (cache, _, _) = cache(10);

        let (results, fetches) =
            race_get_or_set(&cache, 8, None, Err(CallError::transient("connection reset"))).await;

        assert_eq!(fetches, 1);
        assert!(results.iter().all(|r| *r == Err(CallError::transient("connection reset"))));
        assert!(cache.get("insight:shared").await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_leader_hands_fetch_to_waiter() {
        let (cache, _, _) = cache(10);

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_set("k", None, || std::future::pending::<Result<Value, CallError>>())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_set("k", None, || async { Ok::<_, CallError>(json!("second try")) })
                    .await
            })
        };
        tokio::task::yield_now().await;

        leader.abort();
        let _ = leader.await;

        assert_eq!(waiter.await.unwrap(), Ok(json!("second try")));
        assert_eq!(cache.get("k").await, Some(json!("second try")));
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_set_failed_fetch_is_not_cached() {
        let (cache, _, _) = cache(10);

        let first: Result<Value, CallError> = cache
            .get_or_set("k", None, || async { Err(CallError::transient("offline")) })
            .await;
        assert_eq!(first, Err(CallError::transient("offline")));

        let second: Result<Value, CallError> =
            cache.get_or_set("k", None, || async { Ok(json!("ok")) }).await;
        assert_eq!(second, Ok(json!("ok")));
        assert_eq!(cache.get("k").await, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_nothing_behind() {
        let (cache, _, _) = cache(10);
        let token = CancellationToken::new();
        token.cancel();

        let result = cache
            .get_or_set_cancellable(&token, "k", None, || std::future::pending())
            .await;

        assert_eq!(result, Err(CallError::Cancelled));
        assert!(cache.get("k").await.is_none());
        assert!(cache.inflight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_event_hook_observes_outcomes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let store = Arc::new(MemoryKvStore::new());
        let cache = TieredCache::new(CacheConfig::default(), store, ManualClock::new(0))
            .with_event_hook(Arc::new(move |e: &CacheEvent| seen_clone.lock().push(e.outcome)));

        cache.get("k").await;
        cache.set("k", json!(1), None).await.unwrap();
        cache.get("k").await;

        assert_eq!(*seen.lock(), vec![CacheOutcome::Miss, CacheOutcome::MemoryHit]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval_until_shutdown() {
        let store = Arc::new(MemoryKvStore::new());
        let clock = crate::clock::SystemClock::shared();
        let config = CacheConfig {
            sweep_interval: Duration::from_secs(60),
            ..CacheConfig::default()
        };
        let cache = Arc::new(TieredCache::new(config, store.clone(), clock));
        cache.set("short", json!(1), Some(Duration::from_secs(30))).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = cache.spawn_sweeper(shutdown.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
