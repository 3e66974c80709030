//! Two-tier read-through cache for computed AI results.
//!
//! ```text
//! get(key) ─► memory tier ──hit──► value
//!                 │ miss
//!                 ▼
//!             durable tier (KvStore, "cache:<key>") ──hit──► promote ─► value
//!                 │ miss
//!                 ▼
//!               None
//! ```
//!
//! Writes go to the durable tier first, then memory. A zero TTL means the
//! value is not cached at all. Expired entries are purged when read and by
//! [`TieredCache::sweep_expired`].

mod memory;
mod tiered;

pub use tiered::TieredCache;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory-tier capacity; the oldest-inserted entry is evicted past it
    pub memory_max_entries: usize,
    /// TTL applied when a write does not specify one
    pub default_ttl: Duration,
    /// How often the background sweeper purges expired durable entries
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_entries: 100,
            default_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// A cached value with its lifetime, stored as JSON in the durable tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub created_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(data: Value, now_ms: i64, ttl: Duration) -> Self {
        Self {
            data,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl.as_millis() as i64),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }
}

/// How a lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    MemoryHit,
    DurableHit,
    Miss,
    /// Found but past its expiry; purged and reported as a miss
    Expired,
}

impl CacheOutcome {
    #[must_use]
    pub fn is_hit(self) -> bool {
        matches!(self, Self::MemoryHit | Self::DurableHit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: String,
    pub outcome: CacheOutcome,
}

/// Diagnostics hook for lookups. Informational only.
pub type CacheHook = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
}

impl CacheStats {
    /// Fraction of lookups answered from either tier (0.0 - 1.0)
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}
