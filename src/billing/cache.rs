use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// key: billing-meter-cache -> stale-while-revalidate per key
///
/// Values younger than `fresh_for` are served as-is. Older values, up to `expire_after`, are
/// still served to every caller except the one that wins the key's refresh lock and recomputes.
/// Past `expire_after` callers queue on the refresh lock so only one computation runs.
pub struct MeterCache<K, V> {
    entries: DashMap<K, Arc<Slot<V>>>,
    fresh_for: Duration,
    expire_after: Duration,
}

struct Slot<V> {
    cached: RwLock<Option<Cached<V>>>,
    refresh: Mutex<()>,
}

struct Cached<V> {
    value: V,
    stored_at: Instant,
}

enum Lookup<V> {
    Fresh(V),
    Stale(V),
    Missing,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        Self {
            cached: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    fn peek(&self, fresh_for: Duration, expire_after: Duration) -> Lookup<V> {
        let guard = match self.cached.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(cached) = guard.as_ref() else {
            return Lookup::Missing;
        };
        let age = cached.stored_at.elapsed();
        if age < fresh_for {
            Lookup::Fresh(cached.value.clone())
        } else if age < expire_after {
            Lookup::Stale(cached.value.clone())
        } else {
            Lookup::Missing
        }
    }

    fn is_expired(&self, expire_after: Duration) -> bool {
        let guard = match self.cached.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .as_ref()
            .map_or(true, |cached| cached.stored_at.elapsed() >= expire_after)
    }

    fn store(&self, value: V) {
        let mut guard = match self.cached.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Cached {
            value,
            stored_at: Instant::now(),
        });
    }
}

impl<K, V> MeterCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(fresh_for: Duration, expire_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            fresh_for,
            expire_after: expire_after.max(fresh_for),
        }
    }

    pub async fn get_or_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self
            .entries
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        match slot.peek(self.fresh_for, self.expire_after) {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Stale(value) => {
                let Ok(_refresh) = slot.refresh.try_lock() else {
                    return Ok(value);
                };
                if let Lookup::Fresh(value) = slot.peek(self.fresh_for, self.expire_after) {
                    return Ok(value);
                }
                let value = compute().await?;
                slot.store(value.clone());
                self.prune_expired();
                Ok(value)
            }
            Lookup::Missing => {
                let _refresh = slot.refresh.lock().await;
                match slot.peek(self.fresh_for, self.expire_after) {
                    Lookup::Fresh(value) | Lookup::Stale(value) => Ok(value),
                    Lookup::Missing => {
                        let value = compute().await?;
                        slot.store(value.clone());
                        self.prune_expired();
                        Ok(value)
                    }
                }
            }
        }
    }

    /// Drops slots that can no longer be served and that no caller is refreshing.
    fn prune_expired(&self) {
        let expire_after = self.expire_after;
        self.entries
            .retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.is_expired(expire_after));
    }
}
