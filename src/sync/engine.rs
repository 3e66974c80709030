// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::PendingChangeLog;
use super::stores::{LocalStore, RemoteStore};
use super::types::{
    ChangeAction, EntityType, PendingChange, Record, SyncCursor, SyncReport, SyncStatus,
};
use super::{SyncConfig, SyncError};
use crate::clock::SharedClock;
use crate::connectivity::Connectivity;
use crate::error::CallError;
use crate::resilience::{CircuitBreaker, RateLimiter};
use crate::storage::{load_json, save_json, KvStore, StorageError};

const CURSOR_KEY: &str = "sync:cursor";

/// Background sync yields to interactive calls sharing the limiter.
const SYNC_PRIORITY: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Adopt,
    KeepLocal,
    Unchanged,
}

/// Decide which version of one record survives a pull.
fn resolve(
    entity_type: EntityType,
    local: Option<&Record>,
    remote: &Record,
    pending: Option<&PendingChange>,
    skew_ms: i64,
) -> Resolution {
    // A local delete not yet pushed wins until it is
    if pending.is_some_and(|c| c.action == ChangeAction::Delete) {
        return Resolution::KeepLocal;
    }
    let Some(local) = local else {
        return Resolution::Adopt;
    };
    if local == remote {
        return Resolution::Unchanged;
    }
    match entity_type {
        EntityType::Settings if pending.is_some() => Resolution::KeepLocal,
        EntityType::Settings => Resolution::Adopt,
        EntityType::Entry if remote.updated_at > local.updated_at.saturating_add(skew_ms) => {
            Resolution::Adopt
        }
        EntityType::Entry => Resolution::KeepLocal,
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    store: Arc<dyn KvStore>,
    pending: PendingChangeLog,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    connectivity: Connectivity,
    clock: SharedClock,
    status: watch::Sender<SyncStatus>,
    last_sync_at: Mutex<Option<i64>>,
    running: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Build the engine, restoring the pending-change log and sync cursor.
    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KvStore>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        connectivity: Connectivity,
        clock: SharedClock,
    ) -> Result<Self, SyncError> {
        let pending = PendingChangeLog::load(store.clone()).await?;
        let last_sync_at = match load_json::<SyncCursor>(store.as_ref(), CURSOR_KEY).await {
            Ok(cursor) => cursor.and_then(|c| c.last_sync_at),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable sync cursor");
                None
            }
        };

        let pending_count = pending.len().await;
        crate::metrics::set_pending_changes(pending_count);
        info!(pending = pending_count, ?last_sync_at, "Sync engine ready");

        let (status, _) = watch::channel(SyncStatus::Idle);
        Ok(Self {
            config,
            local,
            remote,
            store,
            pending,
            limiter,
            breaker,
            connectivity,
            clock,
            status,
            last_sync_at: Mutex::new(last_sync_at),
            running: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn cursor(&self) -> SyncCursor {
        SyncCursor {
            last_sync_at: *self.last_sync_at.lock(),
            status: self.status(),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    pub async fn pending_changes(&self) -> Vec<PendingChange> {
        self.pending.snapshot().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Register intent to propagate a local change.
    pub async fn record_change(
        &self,
        entity_type: EntityType,
        action: ChangeAction,
        entity_id: &str,
    ) -> Result<PendingChange, SyncError> {
        let change = self
            .pending
            .record(entity_type, action, entity_id, self.clock.now_ms())
            .await?;
        debug!(entity = %entity_type, id = entity_id, action = ?change.action, "Local change recorded");
        Ok(change)
    }

    /// Write `record` to the local replica and queue it for push.
    pub async fn save_local(&self, entity_type: EntityType, record: Record) -> Result<PendingChange, SyncError> {
        let id = record.id.clone();
        let existed = self.local.get(entity_type, &id).await?.is_some();
        self.local.put(entity_type, record).await?;
        let action = if existed { ChangeAction::Update } else { ChangeAction::Create };
        self.record_change(entity_type, action, &id).await
    }

    /// Delete locally and queue the delete for push.
    pub async fn delete_local(&self, entity_type: EntityType, id: &str) -> Result<PendingChange, SyncError> {
        self.local.delete(entity_type, id).await?;
        self.record_change(entity_type, ChangeAction::Delete, id).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync runs
    // ═══════════════════════════════════════════════════════════════════════

    /// Pull then push. Failures on individual records are collected in the
    /// report; what succeeded stays applied.
    pub async fn full_sync(&self) -> Result<SyncReport, SyncError> {
        self.run("full", true, true).await
    }

    /// Adopt remote versions that win last-write-wins.
    pub async fn pull(&self) -> Result<SyncReport, SyncError> {
        self.run("pull", true, false).await
    }

    /// Send pending changes to the remote in change order.
    pub async fn push(&self) -> Result<SyncReport, SyncError> {
        self.run("push", false, true).await
    }

    async fn run(&self, kind: &'static str, pull: bool, push: bool) -> Result<SyncReport, SyncError> {
        let Ok(_running) = self.running.try_lock() else {
            debug!(kind, "Sync already running, skipped");
            return Err(SyncError::AlreadyRunning);
        };

        if !self.connectivity.is_online() {
            self.publish(SyncStatus::Offline);
            return Err(SyncError::Offline);
        }

        let started = Instant::now();
        self.publish(SyncStatus::Syncing);

        let mut report = SyncReport::default();
        if pull {
            self.pull_into(&mut report).await;
        }
        if push {
            self.push_into(&mut report).await;
        }

        let status = if report.is_clean() {
            self.mark_synced().await;
            SyncStatus::Synced
        } else {
            SyncStatus::Error
        };
        self.publish(status);
        crate::metrics::record_sync_run(status.as_str(), started.elapsed());

        info!(
            kind,
            status = status.as_str(),
            pulled = report.pulled,
            adopted = report.adopted,
            kept_local = report.kept_local,
            pushed = report.pushed,
            failed = report.failed,
            first_error = ?report.first_error,
            "Sync finished"
        );
        Ok(report)
    }

    async fn pull_into(&self, report: &mut SyncReport) {
        let _timer = crate::metrics::LatencyTimer::new("sync", "pull");
        for entity_type in EntityType::ALL {
            let remote_records = match self.guarded(|| self.remote.list(entity_type)).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(entity = %entity_type, error = %e, "Pull failed");
                    report.fail(format!("pull {}: {}", entity_type, e));
                    continue;
                }
            };

            for remote in remote_records {
                report.pulled += 1;
                let id = remote.id.clone();
                if let Err(e) = self.merge(entity_type, remote, report).await {
                    warn!(entity = %entity_type, id = %id, error = %e, "Could not apply remote record");
                    report.fail(format!("pull {} {}: {}", entity_type, id, e));
                }
            }
        }
    }

    async fn merge(&self, entity_type: EntityType, remote: Record, report: &mut SyncReport) -> Result<(), StorageError> {
        let pending = self.pending.get(entity_type, &remote.id).await;
        let local = self.local.get(entity_type, &remote.id).await?;
        let skew_ms = self.config.clock_skew_tolerance.as_millis() as i64;

        match resolve(entity_type, local.as_ref(), &remote, pending.as_ref(), skew_ms) {
            Resolution::Unchanged => report.unchanged += 1,
            Resolution::Adopt => {
                if let Some(local) = &local {
                    info!(
                        entity = %entity_type,
                        id = %remote.id,
                        local_updated_at = local.updated_at,
                        remote_updated_at = remote.updated_at,
                        "SyncConflictResolved: remote version adopted"
                    );
                    crate::metrics::record_conflict_resolved("remote");
                    if pending.is_some() {
                        self.pending.discard(entity_type, &remote.id).await?;
                    }
                }
                self.local.put(entity_type, remote).await?;
                report.adopted += 1;
            }
            Resolution::KeepLocal => {
                info!(
                    entity = %entity_type,
                    id = %remote.id,
                    local_updated_at = local.as_ref().map(|l| l.updated_at),
                    remote_updated_at = remote.updated_at,
                    "SyncConflictResolved: local version kept"
                );
                crate::metrics::record_conflict_resolved("local");
                report.kept_local += 1;
            }
        }
        Ok(())
    }

    async fn push_into(&self, report: &mut SyncReport) {
        let _timer = crate::metrics::LatencyTimer::new("sync", "push");
        for change in self.pending.snapshot().await {
            if !self.connectivity.is_online() {
                debug!("Connectivity lost, stopping push");
                break;
            }

            let entity_type = change.entity_type;
            let result = match change.action {
                ChangeAction::Create | ChangeAction::Update => {
                    let record = match self.local.get(entity_type, &change.entity_id).await {
                        Ok(Some(record)) => record,
                        Ok(None) => {
                            debug!(entity = %entity_type, id = %change.entity_id, "Local record gone, dropping change");
                            match self.pending.complete(&change).await {
                                Ok(_) => report.dropped += 1,
                                Err(e) => report.fail(e),
                            }
                            continue;
                        }
                        Err(e) => {
                            report.fail(format!("push {} {}: {}", entity_type, change.entity_id, e));
                            continue;
                        }
                    };
                    if change.action == ChangeAction::Create {
                        self.guarded(|| self.remote.create(entity_type, &record)).await
                    } else {
                        self.guarded(|| self.remote.update(entity_type, &record)).await
                    }
                }
                ChangeAction::Delete => {
                    self.guarded(|| self.remote.delete(entity_type, &change.entity_id)).await
                }
            };

            match result {
                Ok(()) => match self.pending.complete(&change).await {
                    Ok(_) => report.pushed += 1,
                    Err(e) => report.fail(e),
                },
                Err(e) => {
                    warn!(entity = %entity_type, id = %change.entity_id, error = %e, "Push failed");
                    let stop = matches!(e, CallError::BreakerOpen { .. } | CallError::Cancelled);
                    report.fail(format!("push {} {}: {}", entity_type, change.entity_id, e));
                    if stop {
                        break;
                    }
                }
            }
        }
    }

    /// Run one remote call through the limiter and the breaker.
    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, CallError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let breaker = &*self.breaker;
        let op = &op;
        self.limiter
            .execute(SYNC_PRIORITY, move || breaker.call(move || op()))
            .await
    }

    async fn mark_synced(&self) {
        let now = self.clock.now_ms();
        *self.last_sync_at.lock() = Some(now);
        let cursor = SyncCursor {
            last_sync_at: Some(now),
            status: SyncStatus::Synced,
        };
        if let Err(e) = save_json(self.store.as_ref(), CURSOR_KEY, &cursor).await {
            warn!(error = %e, "Failed to persist sync cursor");
        }
    }

    fn publish(&self, status: SyncStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = previous.as_str(), to = status.as_str(), "Sync status changed");
        }
    }

    /// Run `full_sync` on every reconnect and every `auto_sync_interval`
    /// until `shutdown` is cancelled.
    pub fn spawn_auto_sync(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut online_rx = engine.connectivity.subscribe();
            let mut ticker = engine.config.auto_sync_interval.map(|period| {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Auto sync stopped");
                        return;
                    }
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *online_rx.borrow_and_update() {
                            engine.sync_logged("reconnect").await;
                        } else {
                            engine.publish(SyncStatus::Offline);
                        }
                    }
                    _ = next_tick(&mut ticker) => {
                        if engine.connectivity.is_online() {
                            engine.sync_logged("interval").await;
                        }
                    }
                }
            }
        })
    }

    async fn sync_logged(&self, trigger: &'static str) {
        match self.full_sync().await {
            Ok(_) => {}
            Err(SyncError::AlreadyRunning) | Err(SyncError::Offline) => {}
            Err(e) => warn!(trigger, error = %e, "Automatic sync failed"),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
