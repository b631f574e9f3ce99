use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A cached value and the instant it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub data: V,
    pub timestamp: Instant,
}

impl<V> CacheEntry<V> {
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    /// Strictly older than `ttl`. An entry exactly `ttl` old is still fresh.
    pub fn is_stale_at(&self, now: Instant, ttl: Duration) -> bool {
        self.age_at(now) > ttl
    }
}

/// String-keyed cache with per-entry timestamps.
///
/// The TTL is passed on every read rather than stored, so a settings change
/// applies to entries that were written under the old timeout.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    pub fn insert(&self, key: &str, data: V) {
        self.insert_at(key, data, Instant::now());
    }

    pub fn insert_at(&self, key: &str, data: V, timestamp: Instant) {
        self.entries.insert(key.to_string(), CacheEntry { data, timestamp });
    }

    /// Entry regardless of age.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|e| e.data.clone())
    }

    /// Entry only if it is within `ttl` of `now`.
    pub fn get_fresh_at(&self, key: &str, now: Instant, ttl: Duration) -> Option<V> {
        let entry = self.entries.get(key)?;
        if entry.is_stale_at(now, ttl) {
            None
        } else {
            Some(entry.data.clone())
        }
    }

    /// Drop every entry older than `ttl`. Returns how many were removed.
    pub fn evict_expired_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, e| {
            let keep = !e.is_stale_at(now, ttl);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn entry_at_exact_ttl_is_still_fresh() {
        let cache = TtlCache::new();
        let t0 = Instant::now();
        cache.insert_at("a", 1, t0);

        assert_eq!(cache.get_fresh_at("a", t0 + TTL, TTL), Some(1));
        assert_eq!(cache.get_fresh_at("a", t0 + TTL + Duration::from_millis(1), TTL), None);
        // Stale entries stay readable through the plain lookup.
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn eviction_only_removes_expired_keys() {
        let cache = TtlCache::new();
        let t0 = Instant::now();
        cache.insert_at("old", "x", t0);
        cache.insert_at("new", "y", t0 + Duration::from_secs(200));

        let now = t0 + Duration::from_secs(400);
        assert_eq!(cache.evict_expired_at(now, TTL), 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn reinsert_refreshes_timestamp() {
        let cache = TtlCache::new();
        let t0 = Instant::now();
        cache.insert_at("k", 1, t0);
        cache.insert_at("k", 2, t0 + Duration::from_secs(350));

        let now = t0 + Duration::from_secs(400);
        assert_eq!(cache.get_fresh_at("k", now, TTL), Some(2));
        assert_eq!(cache.evict_expired_at(now, TTL), 0);
    }
}
