use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Source of monotonic time for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Memoizes slow lookups for a fixed time-to-live.
///
/// Readers share a read lock; a miss releases it and runs the loader with no
/// lock held, then takes the write lock only to store a successful result.
/// Concurrent misses on the same key may each run the loader. A loader that
/// yields `None` leaves the key uncached, so the next call retries.
pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<K, CachedValue<V>>>,
}

#[derive(Debug, Clone)]
struct CachedValue<V> {
    value: V,
    expires_at: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get_or_load<F>(&self, key: &K, loader: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        if let Some(hit) = self.fresh(key) {
            return Some(hit);
        }

        let value = loader()?;
        let expires_at = self.clock.now() + self.ttl;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.clone(),
                CachedValue {
                    value: value.clone(),
                    expires_at,
                },
            );
        Some(value)
    }

    fn fresh(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let cached = entries.get(key)?;
        (self.clock.now() < cached.expires_at).then(|| cached.value.clone())
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use std::sync::Mutex;

    use super::*;

    pub(crate) struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.now.lock().expect("clock lock");
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().expect("clock lock")
        }
    }
}
