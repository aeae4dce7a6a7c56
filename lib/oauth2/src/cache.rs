//! Time-limited, single-flight cache for user-info lookups.
//!
//! Concurrent requests for the same key share one upstream load instead of
//! each hitting the user-info endpoint. Failures are never cached, and
//! expiry is checked at lookup time rather than by a background sweeper.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cache of user-info claim sets, keyed by access token.
pub type UserInfoCache = SingleFlightCache<Map<String, Value>>;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Caches successfully loaded values for a bounded duration.
///
/// A `ttl` of `None` disables caching entirely: every lookup runs its
/// loader. Per-key async mutexes serialize loads so that only one caller
/// pays for a miss.
pub struct SingleFlightCache<V> {
    ttl: Option<Duration>,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Entry<V>>>>>>,
}

impl<V: Clone> SingleFlightCache<V> {
    /// Creates a cache with the given time-to-live.
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<Option<Entry<V>>>> {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Sweep dead keys on lookup so the map does not grow without bound.
        // A slot that cannot be locked has a load in flight and stays.
        slots.retain(|k, slot| {
            if k == key {
                return true;
            }
            let Ok(guard) = slot.try_lock() else {
                return true;
            };
            match guard.as_ref() {
                Some(entry) => self.ttl.is_some_and(|ttl| entry.stored_at.elapsed() < ttl),
                None => false,
            }
        });
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Returns the cached value for `key`, loading it if absent or expired.
    ///
    /// While one caller's loader is in flight, other callers for the same
    /// key wait and then observe its result. A loader error is returned to
    /// every waiter but leaves the cache unpopulated, so the next lookup
    /// tries again.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            match self.ttl {
                Some(ttl) if entry.stored_at.elapsed() < ttl => return Ok(entry.value.clone()),
                _ => {
                    *guard = None;
                }
            }
        }

        let value = loader().await?;
        if self.ttl.is_some() {
            *guard = Some(Entry {
                value: value.clone(),
                stored_at: Instant::now(),
            });
        }
        Ok(value)
    }

    /// Drops any cached value for `key`.
    pub fn invalidate(&self, key: &str) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots.remove(key);
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
        value: &str,
    ) -> impl Future<Output = Result<String, String>> {
        let calls = Arc::clone(calls);
        let value = value.to_string();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    #[tokio::test]
    async fn second_lookup_within_ttl_is_served_from_cache() {
        let cache = SingleFlightCache::new(Some(Duration::from_secs(20)));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_load("alice", || counting_loader(&calls, "v1"))
            .await;
        let second = cache
            .get_or_load("alice", || counting_loader(&calls, "v2"))
            .await;

        assert_eq!(first, Ok("v1".to_string()));
        assert_eq!(second, Ok("v1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keys_are_cached_independently() {
        let cache = SingleFlightCache::new(Some(Duration::from_secs(20)));
        let calls = Arc::new(AtomicUsize::new(0));

        let alice = cache
            .get_or_load("alice", || counting_loader(&calls, "a"))
            .await;
        let bob = cache
            .get_or_load("bob", || counting_loader(&calls, "b"))
            .await;

        assert_eq!(alice, Ok("a".to_string()));
        assert_eq!(bob, Ok("b".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_reloaded() {
        let cache = SingleFlightCache::new(Some(Duration::ZERO));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_load("alice", || counting_loader(&calls, "v1"))
            .await;
        let second = cache
            .get_or_load("alice", || counting_loader(&calls, "v2"))
            .await;

        assert_eq!(first, Ok("v1".to_string()));
        assert_eq!(second, Ok("v2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_cache_always_loads() {
        let cache = SingleFlightCache::new(None);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let _ = cache
                .get_or_load("alice", || counting_loader(&calls, "v"))
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: SingleFlightCache<String> =
            SingleFlightCache::new(Some(Duration::from_secs(20)));
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>("boom".to_string())
                }
            }
        };

        assert!(cache.get_or_load("alice", failing.clone()).await.is_err());
        assert!(cache.get_or_load("alice", failing).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let recovered = cache
            .get_or_load("alice", || counting_loader(&calls, "v"))
            .await;
        assert_eq!(recovered, Ok("v".to_string()));
    }

    #[tokio::test]
    async fn invalidate_forces_a_reload() {
        let cache = SingleFlightCache::new(Some(Duration::from_secs(20)));
        let calls = Arc::new(AtomicUsize::new(0));

        let _ = cache
            .get_or_load("alice", || counting_loader(&calls, "v1"))
            .await;
        cache.invalidate("alice");
        let reloaded = cache
            .get_or_load("alice", || counting_loader(&calls, "v2"))
            .await;

        assert_eq!(reloaded, Ok("v2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_slots_are_dropped_on_later_lookups() {
        let cache = SingleFlightCache::new(Some(Duration::ZERO));
        let calls = Arc::new(AtomicUsize::new(0));

        let _ = cache
            .get_or_load("alice", || counting_loader(&calls, "a"))
            .await;
        let _ = cache
            .get_or_load("bob", || counting_loader(&calls, "b"))
            .await;

        assert_eq!(cache.slot_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_load() {
        let cache = Arc::new(SingleFlightCache::new(Some(Duration::from_secs(20))));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_loader = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, String>("v".to_string())
                }
            }
        };

        let (first, second) = tokio::join!(
            cache.get_or_load("alice", slow_loader.clone()),
            cache.get_or_load("alice", slow_loader),
        );

        assert_eq!(first, Ok("v".to_string()));
        assert_eq!(second, Ok("v".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
