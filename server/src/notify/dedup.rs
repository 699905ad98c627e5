//! Bounded, TTL-limited record of relay message ids already delivered by
//! this instance. Guards against the bus echoing our own publishes back and
//! against duplicate deliveries from other instances.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio_util::sync::CancellationToken;

pub struct MessageDeduplicator {
    ttl: Duration,
    entries: Mutex<LruCache<String, Instant>>,
}

impl MessageDeduplicator {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<String, Instant>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True if `message_id` was marked within the TTL. Does not touch recency.
    pub fn already_delivered(&self, message_id: &str) -> bool {
        self.entries()
            .peek(message_id)
            .is_some_and(|marked| marked.elapsed() < self.ttl)
    }

    /// Record `message_id` as delivered now, evicting the least recently
    /// marked entry when full.
    pub fn mark_delivered(&self, message_id: &str) {
        self.entries().put(message_id.to_string(), Instant::now());
    }

    /// Drop expired entries. Recency order equals mark order, so expired
    /// entries always sit at the cold end.
    pub fn sweep_stale(&self) -> usize {
        let mut entries = self.entries();
        let mut removed = 0;
        while entries
            .peek_lru()
            .is_some_and(|(_, marked)| marked.elapsed() >= self.ttl)
        {
            entries.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically sweep until cancelled. The period equals the TTL.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.ttl.max(Duration::from_millis(10)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_stale();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.len(), "Swept expired dedup entries");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_then_seen() {
        let dedup = MessageDeduplicator::new(10, Duration::from_secs(60));
        assert!(!dedup.already_delivered("m1"));
        dedup.mark_delivered("m1");
        assert!(dedup.already_delivered("m1"));
        assert!(!dedup.already_delivered("m2"));
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_seen_even_if_resident() {
        let dedup = MessageDeduplicator::new(10, Duration::from_millis(30));
        dedup.mark_delivered("m1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dedup.len(), 1);
        assert!(!dedup.already_delivered("m1"));
        assert_eq!(dedup.sweep_stale(), 1);
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recently_marked() {
        let dedup = MessageDeduplicator::new(3, Duration::from_secs(60));
        for id in ["a", "b", "c", "d"] {
            dedup.mark_delivered(id);
        }
        assert_eq!(dedup.len(), 3);
        assert!(!dedup.already_delivered("a"));
        for kept in ["b", "c", "d"] {
            assert!(dedup.already_delivered(kept), "{kept} should survive");
        }
    }

    #[test]
    fn test_remark_refreshes_recency_but_lookup_does_not() {
        let dedup = MessageDeduplicator::new(2, Duration::from_secs(60));
        dedup.mark_delivered("a");
        dedup.mark_delivered("b");
        // Lookup leaves "a" as the eviction candidate.
        assert!(dedup.already_delivered("a"));
        dedup.mark_delivered("a");
        dedup.mark_delivered("c");
        assert!(dedup.already_delivered("a"));
        assert!(!dedup.already_delivered("b"));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let dedup = Arc::new(MessageDeduplicator::new(10, Duration::from_millis(20)));
        dedup.mark_delivered("x");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dedup.clone().run_sweeper(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(dedup.is_empty());
        cancel.cancel();
        task.await.unwrap();
    }
}
