use lru::LruCache;
use tokio::time::{Duration, Instant};

use crate::key::DestKey;

/// Destinations recently found not to speak h2, with the time they were found so
pub struct NegativeCache {
    entries: LruCache<DestKey, Instant>,
    ttl: Duration,
}

impl NegativeCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        NegativeCache {
            entries: LruCache::new(capacity.max(1)),
            ttl,
        }
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &DestKey) -> Option<Instant> {
        self.entries.peek(key).copied()
    }

    pub fn mark(&mut self, key: DestKey, now: Instant) {
        self.entries.put(key, now);
    }

    pub fn forget(&mut self, key: &DestKey) {
        self.entries.pop(key);
    }

    /// Whether an entry exists and is still within the validity window
    pub fn is_fresh(&self, key: &DestKey, now: Instant) -> bool {
        self.peek(key)
            .map_or(false, |t| now.saturating_duration_since(t) < self.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alpn_tunnel::Destination;

    fn key(host: &str) -> DestKey {
        DestKey::derive(&Destination::new(host))
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = NegativeCache::new(16, Duration::from_secs(36));
        let t0 = Instant::now();
        cache.mark(key("example.com"), t0);
        assert!(cache.is_fresh(&key("example.com"), t0 + Duration::from_secs(1)));
        assert!(!cache.is_fresh(&key("example.com"), t0 + Duration::from_secs(36)));
        // stale entries stay until overwritten or evicted
        assert_eq!(cache.peek(&key("example.com")), Some(t0));
        assert!(!cache.is_fresh(&key("example.org"), t0));

        cache.forget(&key("example.com"));
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_marked_is_evicted() {
        let mut cache = NegativeCache::new(2, Duration::from_secs(36));
        let now = Instant::now();
        cache.mark(key("a.example"), now);
        cache.mark(key("b.example"), now);
        cache.mark(key("a.example"), now);
        cache.mark(key("c.example"), now);
        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&key("b.example")).is_none());
        assert!(cache.peek(&key("a.example")).is_some());
        assert!(cache.peek(&key("c.example")).is_some());
    }
}
