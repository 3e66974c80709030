//! Configuration for the resilience subsystem.
//!
//! # Example
//!
//! ```
//! use journal_sync::ResilienceConfig;
//!
//! // Minimal config (uses defaults)
//! let config = ResilienceConfig::default();
//! assert_eq!(config.rate_limit_per_minute, 60);
//!
//! // Durable store plus a tighter quota
//! let config = ResilienceConfig {
//!     store_path: Some("journal.db".into()),
//!     rate_limit_per_minute: 15,
//!     offline_queue_max_size: 50,
//!     ..Default::default()
//! };
//! assert_eq!(config.rate_limit_config().requests_per_minute, 15);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::offline::OfflineQueueConfig;
use crate::resilience::{CircuitConfig, RateLimitConfig};
use crate::sync::SyncConfig;

/// Configuration for the resilience subsystem.
///
/// All fields have sensible defaults. Set `store_path` for anything that
/// should survive a restart; without it every component persists to memory.
#[derive(Debug, Clone, Deserialize)]
pub struct ResilienceConfig {
    /// SQLite file for the durable key-value store (e.g., "journal.db")
    #[serde(default)]
    pub store_path: Option<String>,

    /// Tiered cache
    #[serde(default = "default_cache_memory_max_entries")]
    pub cache_memory_max_entries: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,

    /// Rate limiter ceilings
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_rate_limit_per_day")]
    pub rate_limit_per_day: u32,
    #[serde(default = "default_rate_limit_min_delay_ms")]
    pub rate_limit_min_delay_ms: u64,

    /// Backoff on quota-style upstream rejections
    #[serde(default = "default_quota_max_retries")]
    pub quota_max_retries: u32,
    #[serde(default = "default_quota_retry_initial_ms")]
    pub quota_retry_initial_ms: u64,
    #[serde(default = "default_quota_retry_max_ms")]
    pub quota_retry_max_ms: u64,

    /// Circuit breaker
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_success_threshold")]
    pub circuit_success_threshold: u32,
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,
    #[serde(default = "default_circuit_window_ms")]
    pub circuit_window_ms: u64,

    /// Offline queue
    #[serde(default = "default_offline_queue_max_size")]
    pub offline_queue_max_size: usize,
    #[serde(default = "default_offline_queue_max_retries")]
    pub offline_queue_max_retries: u32,
    #[serde(default = "default_offline_queue_retry_interval_secs")]
    pub offline_queue_retry_interval_secs: u64,

    /// Sync engine
    #[serde(default = "default_sync_clock_skew_ms")]
    pub sync_clock_skew_ms: u64,
    /// Periodic full sync in seconds (0 = only on reconnect)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

fn default_cache_memory_max_entries() -> usize { 100 }
fn default_cache_ttl_secs() -> u64 { 3600 } // 1 hour
fn default_cache_sweep_interval_secs() -> u64 { 300 }
fn default_rate_limit_per_minute() -> u32 { 60 }
fn default_rate_limit_per_day() -> u32 { 1500 }
fn default_rate_limit_min_delay_ms() -> u64 { 1000 }
fn default_quota_max_retries() -> u32 { 3 }
fn default_quota_retry_initial_ms() -> u64 { 1000 }
fn default_quota_retry_max_ms() -> u64 { 30_000 }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_success_threshold() -> u32 { 2 }
fn default_circuit_timeout_ms() -> u64 { 30_000 }
fn default_circuit_window_ms() -> u64 { 60_000 }
fn default_offline_queue_max_size() -> usize { 100 }
fn default_offline_queue_max_retries() -> u32 { 3 }
fn default_offline_queue_retry_interval_secs() -> u64 { 30 }
fn default_sync_clock_skew_ms() -> u64 { 1000 }
fn default_sync_interval_secs() -> u64 { 300 } // 5 minutes

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            cache_memory_max_entries: default_cache_memory_max_entries(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_per_day: default_rate_limit_per_day(),
            rate_limit_min_delay_ms: default_rate_limit_min_delay_ms(),
            quota_max_retries: default_quota_max_retries(),
            quota_retry_initial_ms: default_quota_retry_initial_ms(),
            quota_retry_max_ms: default_quota_retry_max_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_success_threshold: default_circuit_success_threshold(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
            circuit_window_ms: default_circuit_window_ms(),
            offline_queue_max_size: default_offline_queue_max_size(),
            offline_queue_max_retries: default_offline_queue_max_retries(),
            offline_queue_retry_interval_secs: default_offline_queue_retry_interval_secs(),
            sync_clock_skew_ms: default_sync_clock_skew_ms(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

impl ResilienceConfig {
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            memory_max_entries: self.cache_memory_max_entries,
            default_ttl: Duration::from_secs(self.cache_ttl_secs),
            sweep_interval: Duration::from_secs(self.cache_sweep_interval_secs),
        }
    }

    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_minute: self.rate_limit_per_minute,
            requests_per_day: self.rate_limit_per_day,
            min_delay: Duration::from_millis(self.rate_limit_min_delay_ms),
            max_quota_retries: self.quota_max_retries,
            retry_initial_delay: Duration::from_millis(self.quota_retry_initial_ms),
            retry_max_delay: Duration::from_millis(self.quota_retry_max_ms),
        }
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            recovery_timeout: Duration::from_millis(self.circuit_timeout_ms),
            monitoring_window: Duration::from_millis(self.circuit_window_ms),
        }
    }

    #[must_use]
    pub fn offline_queue_config(&self) -> OfflineQueueConfig {
        OfflineQueueConfig {
            max_size: self.offline_queue_max_size,
            max_retries: self.offline_queue_max_retries,
            retry_interval: Duration::from_secs(self.offline_queue_retry_interval_secs),
        }
    }

    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            clock_skew_tolerance: Duration::from_millis(self.sync_clock_skew_ms),
            auto_sync_interval: (self.sync_interval_secs > 0)
                .then(|| Duration::from_secs(self.sync_interval_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_component_defaults() {
        let config = ResilienceConfig::default();

        assert_eq!(config.circuit_config().failure_threshold, CircuitConfig::default().failure_threshold);
        assert_eq!(config.rate_limit_config().min_delay, RateLimitConfig::default().min_delay);
        assert_eq!(config.cache_config().memory_max_entries, CacheConfig::default().memory_max_entries);
        assert_eq!(config.offline_queue_config().max_retries, OfflineQueueConfig::default().max_retries);
        assert_eq!(config.sync_config().clock_skew_tolerance, SyncConfig::default().clock_skew_tolerance);
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: ResilienceConfig = serde_json::from_str(
            r#"{ "store_path": "journal.db", "rate_limit_per_minute": 15, "sync_interval_secs": 0 }"#,
        )
        .unwrap();

        assert_eq!(config.store_path.as_deref(), Some("journal.db"));
        assert_eq!(config.rate_limit_per_minute, 15);
        assert_eq!(config.rate_limit_per_day, 1500);
        assert_eq!(config.sync_config().auto_sync_interval, None);
        assert_eq!(config.cache_config().default_ttl, Duration::from_secs(3600));
    }
}
