// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    DrainHook, DrainOutcome, DrainReport, HandlerRegistry, OfflineQueueConfig, QueueError,
    QueuedOperation,
};
use crate::clock::SharedClock;
use crate::connectivity::Connectivity;
use crate::error::CallError;
use crate::storage::{load_json, save_json, KvStore, StorageError};

pub struct OfflineQueue {
    name: String,
    config: OfflineQueueConfig,
    store: Arc<dyn KvStore>,
    handlers: Arc<HandlerRegistry>,
    connectivity: Connectivity,
    clock: SharedClock,
    items: Mutex<VecDeque<QueuedOperation>>,
    draining: AtomicBool,
    wake: Notify,
    on_outcome: Option<DrainHook>,
}

impl OfflineQueue {
    /// Open the queue named `name`, restoring any persisted items.
    pub async fn open(
        name: impl Into<String>,
        config: OfflineQueueConfig,
        store: Arc<dyn KvStore>,
        handlers: Arc<HandlerRegistry>,
        connectivity: Connectivity,
        clock: SharedClock,
    ) -> Result<Self, QueueError> {
        let name = name.into();
        let key = storage_key(&name);

        let items = match load_json::<VecDeque<QueuedOperation>>(store.as_ref(), &key).await {
            Ok(Some(items)) => items,
            Ok(None) => VecDeque::new(),
            Err(StorageError::Corrupt { message, .. }) => {
                error!(queue = %name, error = %message, "Offline queue state unreadable, starting empty (queued operations lost)");
                VecDeque::new()
            }
            Err(e) => return Err(e.into()),
        };

        if !items.is_empty() {
            info!(queue = %name, restored = items.len(), "Restored offline queue");
        }
        crate::metrics::set_offline_queue_depth(&name, items.len());

        Ok(Self {
            name,
            config,
            store,
            handlers,
            connectivity,
            clock,
            items: Mutex::new(items),
            draining: AtomicBool::new(false),
            wake: Notify::new(),
            on_outcome: None,
        })
    }

    /// Attach a drain-outcome observer.
    #[must_use]
    pub fn with_outcome_hook(mut self, hook: DrainHook) -> Self {
        self.on_outcome = Some(hook);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &OfflineQueueConfig {
        &self.config
    }

    /// Queue an operation for replay through `handler_name`.
    ///
    /// Always admits the new item; past `max_size` the oldest item is
    /// evicted. A failed persist is logged and the item stays queued in
    /// memory.
    pub async fn enqueue(
        &self,
        kind: impl Into<String>,
        handler_name: impl Into<String>,
        payload: Value,
    ) -> Result<String, QueueError> {
        let op = QueuedOperation {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            handler_name: handler_name.into(),
            payload,
            created_at: self.clock.now_ms(),
            retry_count: 0,
            max_retries: self.config.max_retries,
            last_error: None,
        };
        let id = op.id.clone();

        let mut items = self.items.lock().await;
        debug!(queue = %self.name, id = %op.id, kind = %op.kind, "Operation queued for replay");
        items.push_back(op);

        let mut evicted = Vec::new();
        while items.len() > self.config.max_size {
            match items.pop_front() {
                Some(oldest) => evicted.push(oldest),
                None => break,
            }
        }
        self.persist(&items).await;
        drop(items);

        for oldest in evicted {
            warn!(
                queue = %self.name,
                id = %oldest.id,
                kind = %oldest.kind,
                max_size = self.config.max_size,
                "Offline queue full, evicted oldest operation"
            );
            self.emit(DrainOutcome::Evicted {
                id: oldest.id,
                kind: oldest.kind,
            });
        }

        self.wake.notify_one();
        Ok(id)
    }

    /// Typed [`enqueue`](Self::enqueue).
    pub async fn enqueue_as<T: Serialize + ?Sized>(
        &self,
        kind: &str,
        handler_name: &str,
        payload: &T,
    ) -> Result<String, QueueError> {
        let payload = serde_json::to_value(payload).map_err(|e| QueueError::InvalidPayload {
            kind: kind.to_string(),
            message: e.to_string(),
        })?;
        self.enqueue(kind, handler_name, payload).await
    }

    /// One drain pass, oldest first, while online.
    ///
    /// Stops at the first item that fails and is kept, so it is retried
    /// before anything younger. Items that exhaust `max_retries` are
    /// dropped and the pass moves on. Returns immediately if another pass
    /// is already running.
    pub async fn process(&self) -> Result<DrainReport, QueueError> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.name, "Drain already in progress");
            return Ok(DrainReport {
                remaining: self.len().await,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        while self.connectivity.is_online() {
            let head = self.items.lock().await.front().cloned();
            let Some(op) = head else {
                break;
            };

            let result = match self.handlers.get(&op.handler_name) {
                Some(handler) => handler.handle(&op).await,
                None => Err(CallError::upstream(format!(
                    "no handler registered for '{}'",
                    op.handler_name
                ))),
            };

            let mut items = self.items.lock().await;
            // The item may have been evicted or cleared while its handler ran
            let Some(pos) = items.iter().position(|item| item.id == op.id) else {
                continue;
            };

            match result {
                Ok(()) => {
                    items.remove(pos);
                    self.persist(&items).await;
                    drop(items);
                    report.succeeded += 1;
                    debug!(queue = %self.name, id = %op.id, kind = %op.kind, "Replayed queued operation");
                    self.emit(DrainOutcome::Replayed { id: op.id, kind: op.kind });
                }
                Err(CallError::Cancelled) => {
                    debug!(queue = %self.name, id = %op.id, "Replay cancelled, item kept");
                    break;
                }
                Err(err) => {
                    let error = err.to_string();
                    let item = &mut items[pos];
                    item.retry_count += 1;
                    item.last_error = Some(error.clone());
                    let retry_count = item.retry_count;

                    if retry_count >= item.max_retries {
                        items.remove(pos);
                        self.persist(&items).await;
                        drop(items);
                        report.dropped += 1;
                        error!(
                            queue = %self.name,
                            id = %op.id,
                            kind = %op.kind,
                            retry_count,
                            error = %error,
                            "Permanent failure: queued operation dropped after max retries"
                        );
                        self.emit(DrainOutcome::PermanentFailure {
                            id: op.id,
                            kind: op.kind,
                            retry_count,
                            error,
                        });
                    } else {
                        self.persist(&items).await;
                        drop(items);
                        report.failed += 1;
                        warn!(
                            queue = %self.name,
                            id = %op.id,
                            kind = %op.kind,
                            retry_count,
                            error = %error,
                            "Replay failed, will retry"
                        );
                        self.emit(DrainOutcome::Failed {
                            id: op.id,
                            kind: op.kind,
                            retry_count,
                            error,
                        });
                        break;
                    }
                }
            }
        }

        report.remaining = self.len().await;
        if report.succeeded + report.failed + report.dropped > 0 {
            info!(
                queue = %self.name,
                succeeded = report.succeeded,
                failed = report.failed,
                dropped = report.dropped,
                remaining = report.remaining,
                "Offline queue drain pass complete"
            );
        }
        Ok(report)
    }

    /// Run the drain loop until `shutdown` is cancelled.
    ///
    /// Drains immediately when connectivity comes back, after each enqueue
    /// while online, and every `retry_interval` while items remain.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut online_rx = queue.connectivity.subscribe();
            let mut ticker = tokio::time::interval(queue.config.retry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            if queue.connectivity.is_online() {
                queue.drain_logged().await;
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(queue = %queue.name, "Offline queue loop stopped");
                        return;
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *online_rx.borrow_and_update() {
                            info!(queue = %queue.name, "Back online, draining offline queue");
                            queue.drain_logged().await;
                        }
                    }
                    _ = queue.wake.notified() => {
                        if queue.connectivity.is_online() {
                            queue.drain_logged().await;
                        }
                    }
                    _ = ticker.tick() => {
                        if queue.connectivity.is_online() && !queue.is_empty().await {
                            queue.drain_logged().await;
                        }
                    }
                }
            }
        })
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.process().await {
            warn!(queue = %self.name, error = %e, "Offline queue drain failed");
        }
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Snapshot of queued items, oldest first.
    pub async fn items(&self) -> Vec<QueuedOperation> {
        self.items.lock().await.iter().cloned().collect()
    }

    /// Drop every queued item.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut items = self.items.lock().await;
        let dropped = items.len();
        items.clear();
        save_json(self.store.as_ref(), &storage_key(&self.name), &*items).await?;
        crate::metrics::set_offline_queue_depth(&self.name, 0);
        warn!(queue = %self.name, dropped, "Offline queue cleared");
        Ok(())
    }

    async fn persist(&self, items: &VecDeque<QueuedOperation>) {
        crate::metrics::set_offline_queue_depth(&self.name, items.len());
        if let Err(e) = save_json(self.store.as_ref(), &storage_key(&self.name), items).await {
            error!(
                queue = %self.name,
                error = %e,
                depth = items.len(),
                "Failed to persist offline queue; items held in memory only"
            );
        }
    }

    fn emit(&self, outcome: DrainOutcome) {
        crate::metrics::record_offline_outcome(&self.name, outcome.label());
        if let Some(hook) = &self.on_outcome {
            hook(&outcome);
        }
    }
}

fn storage_key(name: &str) -> String {
    format!("offline_queue:{}", name)
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::storage::MemoryKvStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        queue: Arc<OfflineQueue>,
        store: Arc<MemoryKvStore>,
        handlers: Arc<HandlerRegistry>,
        connectivity: Connectivity,
    }

    async fn harness(config: OfflineQueueConfig, online: bool) -> Harness {
        let store = Arc::new(MemoryKvStore::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let connectivity = Connectivity::new(online);
        let queue = OfflineQueue::open(
            "default",
            config,
            store.clone(),
            handlers.clone(),
            connectivity.clone(),
            ManualClock::new(0),
        )
        .await
        .unwrap();
        Harness {
            queue: Arc::new(queue),
            store,
            handlers,
            connectivity,
        }
    }

    fn recording_handler(handlers: &HandlerRegistry, name: &str) -> Arc<parking_lot::Mutex<Vec<Value>>> {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        handlers.register_fn(name, move |op| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().push(op.payload);
                Ok(())
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_replays_in_fifo_order_and_removes() {
        let h = harness(OfflineQueueConfig::default(), true).await;
        let seen = recording_handler(&h.handlers, "sync");

        for n in 0..3 {
            h.queue.enqueue("push", "sync", json!(n)).await.unwrap();
        }
        let report = h.queue.process().await.unwrap();

        assert_eq!(report, DrainReport { succeeded: 3, failed: 0, dropped: 0, remaining: 0 });
        assert_eq!(*seen.lock(), vec![json!(0), json!(1), json!(2)]);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_head_blocks_younger_items() {
        let h = harness(OfflineQueueConfig::default(), true).await;
        h.handlers.register_fn("flaky", |_| async { Err(CallError::transient("timeout")) });
        let seen = recording_handler(&h.handlers, "ok");

        h.queue.enqueue("a", "flaky", json!(1)).await.unwrap();
        h.queue.enqueue("b", "ok", json!(2)).await.unwrap();

        let report = h.queue.process().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 2);
        assert!(seen.lock().is_empty());
        let items = h.queue.items().await;
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[0].last_error.as_deref(), Some("transient network error: timeout"));
    }

    #[tokio::test]
    async fn test_max_retries_drops_permanently() {
        let config = OfflineQueueConfig { max_retries: 2, ..OfflineQueueConfig::default() };
        let h = harness(config, true).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        h.handlers.register_fn("broken", move |_| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CallError::upstream("rejected"))
            }
        });
        let outcomes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let outcomes_clone = outcomes.clone();
        let queue = OfflineQueue::open(
            "default",
            OfflineQueueConfig { max_retries: 2, ..OfflineQueueConfig::default() },
            h.store.clone(),
            h.handlers.clone(),
            h.connectivity.clone(),
            ManualClock::new(0),
        )
        .await
        .unwrap()
        .with_outcome_hook(Arc::new(move |o: &DrainOutcome| outcomes_clone.lock().push(o.label())));

        queue.enqueue("analyze", "broken", json!({})).await.unwrap();
        assert_eq!(queue.process().await.unwrap().failed, 1);
        let last = queue.process().await.unwrap();
        assert_eq!(last.dropped, 1);
        assert_eq!(last.remaining, 0);

        // Never retried again
        queue.process().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*outcomes.lock(), vec!["failed", "permanent_failure"]);
    }

    #[tokio::test]
    async fn test_missing_handler_counts_as_failure() {
        let config = OfflineQueueConfig { max_retries: 1, ..OfflineQueueConfig::default() };
        let h = harness(config, true).await;
        h.queue.enqueue("analyze", "unregistered", json!({})).await.unwrap();

        let report = h.queue.process().await.unwrap();

        assert_eq!(report.dropped, 1);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_max_size_evicts_oldest() {
        let config = OfflineQueueConfig { max_size: 2, ..OfflineQueueConfig::default() };
        let h = harness(config, false).await;

        h.queue.enqueue("k", "h", json!(1)).await.unwrap();
        h.queue.enqueue("k", "h", json!(2)).await.unwrap();
        let newest = h.queue.enqueue("k", "h", json!(3)).await.unwrap();

        let items = h.queue.items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].payload, json!(2));
        assert_eq!(items[1].id, newest);
    }

    #[tokio::test]
    async fn test_offline_pass_replays_nothing() {
        let h = harness(OfflineQueueConfig::default(), false).await;
        let seen = recording_handler(&h.handlers, "sync");
        h.queue.enqueue("push", "sync", json!(1)).await.unwrap();

        let report = h.queue.process().await.unwrap();

        assert_eq!(report.remaining, 1);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let h = harness(OfflineQueueConfig::default(), false).await;
        let id = h.queue.enqueue("analyze", "gemini", json!({"entry": "e1"})).await.unwrap();

        let reopened = OfflineQueue::open(
            "default",
            OfflineQueueConfig::default(),
            h.store.clone(),
            h.handlers.clone(),
            h.connectivity.clone(),
            ManualClock::new(0),
        )
        .await
        .unwrap();

        let items = reopened.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, id);
        assert_eq!(items[0].payload, json!({"entry": "e1"}));
    }

    #[tokio::test]
    async fn test_corrupt_state_opens_empty() {
        let store = Arc::new(MemoryKvStore::new());
        store.set("offline_queue:default", "[{ broken").await.unwrap();

        let queue = OfflineQueue::open(
            "default",
            OfflineQueueConfig::default(),
            store,
            Arc::new(HandlerRegistry::new()),
            Connectivity::new(true),
            ManualClock::new(0),
        )
        .await
        .unwrap();

        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_persists_empty_queue() {
        let h = harness(OfflineQueueConfig::default(), false).await;
        h.queue.enqueue("k", "h", json!(1)).await.unwrap();

        h.queue.clear().await.unwrap();

        assert!(h.queue.is_empty().await);
        assert_eq!(h.store.get("offline_queue:default").await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_for_online_transition() {
        let store = Arc::new(MemoryKvStore::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let connectivity = Connectivity::new(false);
        let queue = Arc::new(
            OfflineQueue::open(
                "default",
                OfflineQueueConfig::default(),
                store,
                handlers.clone(),
                connectivity.clone(),
                SystemClock::shared(),
            )
            .await
            .unwrap(),
        );
        let seen = recording_handler(&handlers, "sync");
        let shutdown = CancellationToken::new();
        let handle = queue.spawn(shutdown.clone());

        queue.enqueue("push", "sync", json!("entry-1")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(seen.lock().is_empty());

        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), vec![json!("entry-1")]);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
