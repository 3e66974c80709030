use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::CacheEntry;

/// Bounded memory tier, evicting the oldest-inserted key first.
///
/// Reads go straight to the map. Every mutation takes the order lock so
/// the map and the insertion order never disagree.
pub(crate) struct MemoryTier {
    entries: DashMap<String, CacheEntry>,
    order: Mutex<VecDeque<String>>,
    max_entries: usize,
}

impl MemoryTier {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries,
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Insert or replace `key`, moving it to the newest position.
    /// Returns the keys evicted to stay within capacity.
    pub(crate) fn insert(&self, key: &str, entry: CacheEntry) -> Vec<String> {
        let mut order = self.order.lock();
        if self.entries.insert(key.to_string(), entry).is_some() {
            if let Some(pos) = order.iter().position(|k| k == key) {
                order.remove(pos);
            }
        }
        order.push_back(key.to_string());

        let mut evicted = Vec::new();
        while order.len() > self.max_entries {
            match order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    evicted.push(oldest);
                }
                None => break,
            }
        }
        evicted
    }

    pub(crate) fn remove(&self, key: &str) -> bool {
        let mut order = self.order.lock();
        let removed = self.entries.remove(key).is_some();
        if removed {
            order.retain(|k| k != key);
        }
        removed
    }

    /// Remove entries matching `pred`, returning how many went.
    fn remove_where(&self, pred: impl Fn(&str, &CacheEntry) -> bool) -> usize {
        let mut order = self.order.lock();
        let before = self.entries.len();
        self.entries.retain(|k, v| !pred(k, v));
        order.retain(|k| self.entries.contains_key(k));
        before - self.entries.len()
    }

    pub(crate) fn remove_prefix(&self, prefix: &str) -> usize {
        self.remove_where(|k, _| k.starts_with(prefix))
    }

    pub(crate) fn remove_expired(&self, now_ms: i64) -> usize {
        self.remove_where(|_, v| v.is_expired(now_ms))
    }

    pub(crate) fn clear(&self) {
        let mut order = self.order.lock();
        self.entries.clear();
        order.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry(n: i64) -> CacheEntry {
        CacheEntry::new(json!(n), 0, Duration::from_secs(60))
    }

    #[test]
    fn test_evicts_oldest_inserted() {
        let tier = MemoryTier::new(2);
        assert!(tier.insert("a", entry(1)).is_empty());
        assert!(tier.insert("b", entry(2)).is_empty());

        let evicted = tier.insert("c", entry(3));

        assert_eq!(evicted, vec!["a"]);
        assert!(tier.get("a").is_none());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let tier = MemoryTier::new(2);
        tier.insert("a", entry(1));
        tier.insert("b", entry(2));
        tier.insert("a", entry(10));

        let evicted = tier.insert("c", entry(3));

        assert_eq!(evicted, vec!["b"]);
        assert_eq!(tier.get("a").map(|e| e.data), Some(json!(10)));
    }

    #[test]
    fn test_remove_prefix_and_expired() {
        let tier = MemoryTier::new(10);
        tier.insert("insight:1", entry(1));
        tier.insert("insight:2", entry(2));
        tier.insert("mood:1", CacheEntry::new(json!(0), 0, Duration::from_millis(5)));

        assert_eq!(tier.remove_prefix("insight:"), 2);
        assert_eq!(tier.remove_expired(10), 1);
        assert_eq!(tier.len(), 0);

        // Order bookkeeping stays consistent after bulk removal
        tier.insert("x", entry(1));
        assert!(tier.remove("x"));
        assert!(!tier.remove("x"));
    }
}
