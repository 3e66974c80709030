// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic journal-sync usage example.
//!
//! Demonstrates:
//! 1. Wiring the subsystem over an in-memory store
//! 2. A fresh AI call, then the same call served from cache
//! 3. Going offline: the call is queued instead of failing
//! 4. Coming back online: the queue replays through its handler
//! 5. A full sync between a local replica and a remote store
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use journal_sync::{
    CachedRequest, CallError, Connectivity, EntityType, HandlerRegistry, MemoryRecordStore,
    Record, ResilienceConfig, Subsystem, SystemClock,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📦 Configuring journal-sync...");
    let config = ResilienceConfig {
        rate_limit_min_delay_ms: 200,
        offline_queue_retry_interval_secs: 1,
        ..Default::default()
    };

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register_fn("generate_insight", |op| async move {
        println!("   └─ Replayed {} ({}) → {}", op.id, op.kind, op.payload);
        Ok::<_, CallError>(())
    });

    let connectivity = Connectivity::new(true);
    let subsystem = Subsystem::open(config, handlers, connectivity.clone(), SystemClock::shared()).await?;
    let shutdown = CancellationToken::new();
    let tasks = subsystem.start(shutdown.clone());
    let caller = subsystem.caller();

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Fresh call, then cached
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🤖 Calling upstream twice for the same insight...");
    let request = CachedRequest::new("insight:2026-10-14", "generate_insight", json!({ "day": "2026-10-14" }))
        .with_ttl(Duration::from_secs(600));
    for _ in 0..2 {
        let outcome = caller
            .call(&request, || async { Ok(json!({ "insight": "You sleep better after evening walks." })) })
            .await?;
        println!("   └─ {:?}", outcome);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Offline: queued
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📴 Going offline...");
    connectivity.set_online(false);
    let weekly = CachedRequest::new("insight:week-41", "generate_insight", json!({ "week": 41 }))
        .with_kind("weekly_insight");
    let outcome = caller.call(&weekly, || async { Ok(json!("unreachable")) }).await?;
    println!("   └─ {:?}", outcome);
    println!("   └─ Queue depth: {}", subsystem.offline_queue().len().await);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Online: replay
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Back online, waiting for replay...");
    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("   └─ Queue depth: {}", subsystem.offline_queue().len().await);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Full sync
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔄 Syncing journal entries...");
    let local = Arc::new(MemoryRecordStore::new());
    let remote = Arc::new(MemoryRecordStore::new());
    remote.insert(EntityType::Entry, Record::new("entry-1", 1_760_000_000_000, json!({ "mood": 3 })));
    let engine = subsystem.sync_engine(local.clone(), remote.clone()).await?;
    engine
        .save_local(EntityType::Entry, Record::new("entry-2", 1_760_000_100_000, json!({ "mood": 5 })))
        .await?;
    let report = engine.full_sync().await?;
    println!("   └─ {:?}", report);
    println!("   └─ Cursor: {:?}", engine.cursor());
    println!(
        "   └─ Local entries: {}, remote entries: {}",
        local.count(EntityType::Entry),
        remote.count(EntityType::Entry)
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    println!("   ✅ Shutdown complete!");

    Ok(())
}

/// Dump all captured metrics, sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut lines: Vec<String> = Vec::new();
    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{} ", v),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} sum={:.6}", count, sum)
            }
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered.trim_end()));
    }

    lines.sort();
    for line in &lines {
        println!("   └─ {}", line);
    }
}
