//! Bounded replay cache keyed by (source, nonce).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::{SecurityError, SecurityResult};

/// Remembers recently seen nonces until the skew window has passed.
///
/// Entries expire `window` after the later of the message timestamp and the
/// moment it was admitted. With a window at least as long as the codec's
/// clock skew, a message is rejected as `INVALID_TIMESTAMP` before its entry
/// can expire.
#[derive(Debug)]
pub struct ReplayCache {
    entries: DashMap<(String, String), DateTime<Utc>>,
    capacity: usize,
    window: Duration,
}

impl ReplayCache {
    /// Creates a cache holding at most `capacity` live entries.
    #[must_use]
    pub fn new(capacity: usize, window: std::time::Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            window: Duration::from_std(window).unwrap_or(Duration::MAX),
        }
    }

    /// Records `(source, nonce)` or reports a replay.
    ///
    /// Insert-if-absent is atomic per key; an expired entry for the same key is
    /// replaced.
    ///
    /// # Errors
    ///
    /// Returns [`SecurityError::ReplayDetected`] for a live duplicate and
    /// [`SecurityError::ReplayCacheFull`] when eviction cannot make room.
    pub fn check_and_insert(
        &self,
        source: &str,
        nonce: &str,
        sent_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SecurityResult<()> {
        if self.entries.len() >= self.capacity {
            let evicted = self.purge_expired(now);
            debug!(evicted, "replay cache at capacity, evicted expired entries");
            if self.entries.len() >= self.capacity {
                return Err(SecurityError::ReplayCacheFull {
                    capacity: self.capacity,
                });
            }
        }

        let expires_at = sent_at
            .max(now)
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        match self.entries.entry((source.to_owned(), nonce.to_owned())) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return Err(SecurityError::ReplayDetected {
                        source_agent: source.to_owned(),
                        nonce: nonce.to_owned(),
                    });
                }
                entry.insert(expires_at);
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
            }
        }
        Ok(())
    }

    /// Removes entries whose window has passed, returning how many were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn window() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    #[test]
    fn duplicate_within_window_detected() {
        let cache = ReplayCache::new(10, window());
        let now = Utc::now();
        cache.check_and_insert("agent-a", "n1", now, now).unwrap();
        let err = cache.check_and_insert("agent-a", "n1", now, now).unwrap_err();
        assert!(matches!(err, SecurityError::ReplayDetected { .. }));

        cache.check_and_insert("agent-b", "n1", now, now).unwrap();
    }

    #[test]
    fn expired_entries_are_replaced() {
        let cache = ReplayCache::new(10, window());
        let sent = Utc::now();
        cache.check_and_insert("agent-a", "n1", sent, sent).unwrap();
        let later = sent + Duration::seconds(301);
        cache.check_and_insert("agent-a", "n1", later, later).unwrap();
    }

    #[test]
    fn old_timestamp_is_remembered_for_a_full_window() {
        let cache = ReplayCache::new(10, window());
        let now = Utc::now();
        let sent = now - Duration::seconds(1_000);
        cache.check_and_insert("agent-a", "n1", sent, now).unwrap();

        let err = cache
            .check_and_insert("agent-a", "n1", sent, now + Duration::seconds(299))
            .unwrap_err();
        assert!(matches!(err, SecurityError::ReplayDetected { .. }));
        assert_eq!(cache.purge_expired(now + Duration::seconds(299)), 0);
        assert_eq!(cache.purge_expired(now + Duration::seconds(300)), 1);
    }

    #[test]
    fn full_cache_evicts_then_fails_closed() {
        let cache = ReplayCache::new(2, window());
        let sent = Utc::now();
        cache.check_and_insert("a", "1", sent, sent).unwrap();
        cache.check_and_insert("a", "2", sent, sent).unwrap();
        let err = cache.check_and_insert("a", "3", sent, sent).unwrap_err();
        assert!(matches!(err, SecurityError::ReplayCacheFull { capacity: 2 }));

        let later = sent + Duration::seconds(301);
        cache.check_and_insert("a", "3", later, later).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_admit_exactly_one() {
        let cache = Arc::new(ReplayCache::new(100, window()));
        let now = Utc::now();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.check_and_insert("a", "same", now, now).is_ok() })
            })
            .collect();
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
