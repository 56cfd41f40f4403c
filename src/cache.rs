//! Bounded, reference-counted resource cache.
//!
//! `BoundedRefCache` keeps at most `capacity` resources resident and hands
//! out [`CacheRef`] handles. A resource is loaded through its
//! [`CacheSource`] the first time it is requested, stays resident while any
//! handle is alive, and is passed to [`CacheSource::evict`] once the last
//! handle is released. Both hooks run without the cache lock held, and at
//! most one load (or eviction) per key is ever in flight.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Loads resources on a cache miss and writes them back on eviction.
pub trait CacheSource: Send + Sync {
    type Key: Copy + Eq + Hash + Debug + Send + Sync;
    type Value: Send + Sync;

    /// Fetch the resource for `key` from its backing store.
    fn load(&self, key: Self::Key) -> Result<Self::Value>;

    /// Called once the last reference to a resident resource is released.
    fn evict(&self, key: Self::Key, value: Arc<Self::Value>) -> Result<()>;
}

struct CacheState<K, V> {
    entries: HashMap<K, Arc<V>>,
    refs: HashMap<K, usize>,
    /// Keys whose load or eviction is running outside the lock.
    in_flight: HashSet<K>,
}

impl<K: Eq + Hash, V> CacheState<K, V> {
    fn resident(&self) -> usize {
        self.entries.len() + self.in_flight.len()
    }
}

pub struct BoundedRefCache<S: CacheSource> {
    source: S,
    state: Mutex<CacheState<S::Key, S::Value>>,
    settled: Condvar,
    /// 0 means unbounded.
    capacity: usize,
}

impl<S: CacheSource> BoundedRefCache<S> {
    pub fn new(source: S, capacity: usize) -> Self {
        Self {
            source,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                refs: HashMap::new(),
                in_flight: HashSet::new(),
            }),
            settled: Condvar::new(),
            capacity,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Get a handle to the resource for `key`, loading it if necessary.
    pub fn get(self: &Arc<Self>, key: S::Key) -> Result<CacheRef<S>> {
        {
            let mut state = self.state.lock();
            loop {
                if state.in_flight.contains(&key) {
                    self.settled.wait(&mut state);
                    continue;
                }

                if let Some(value) = state.entries.get(&key).cloned() {
                    *state.refs.entry(key).or_insert(0) += 1;
                    return Ok(CacheRef::new(Arc::clone(self), key, value));
                }

                if self.capacity > 0 && state.resident() >= self.capacity {
                    return Err(Error::CacheFull);
                }

                state.in_flight.insert(key);
                break;
            }
        }

        let loaded = self.source.load(key);

        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        self.settled.notify_all();

        let value = Arc::new(loaded?);
        state.entries.insert(key, Arc::clone(&value));
        state.refs.insert(key, 1);
        Ok(CacheRef::new(Arc::clone(self), key, value))
    }

    /// Drop one reference to `key`, evicting the resource at zero.
    pub fn release(&self, key: S::Key) -> Result<()> {
        let evicted = {
            let mut state = self.state.lock();
            let remaining = match state.refs.get_mut(&key) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => return Ok(()),
            };
            if remaining > 0 {
                return Ok(());
            }

            state.refs.remove(&key);
            let value = state.entries.remove(&key);
            if value.is_some() {
                state.in_flight.insert(key);
            }
            value
        };

        match evicted {
            Some(value) => self.finish_eviction(key, value),
            None => Ok(()),
        }
    }

    /// Evict every resident resource regardless of outstanding references.
    pub fn close(&self) -> Result<()> {
        let drained: Vec<(S::Key, Arc<S::Value>)> = {
            let mut state = self.state.lock();
            state.refs.clear();
            let drained: Vec<_> = state.entries.drain().collect();
            for (key, _) in &drained {
                state.in_flight.insert(*key);
            }
            drained
        };

        let mut first_error = None;
        for (key, value) in drained {
            if let Err(e) = self.finish_eviction(key, value) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn finish_eviction(&self, key: S::Key, value: Arc<S::Value>) -> Result<()> {
        let result = self.source.evict(key, value);

        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        self.settled.notify_all();
        result
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resident resources, counting loads still in progress.
    pub fn resident(&self) -> usize {
        self.state.lock().resident()
    }

    /// Outstanding references to `key`, 0 when not resident.
    pub fn ref_count(&self, key: S::Key) -> usize {
        self.state.lock().refs.get(&key).copied().unwrap_or(0)
    }
}

/// A counted reference to a cached resource. Dropping it releases the
/// reference; use [`CacheRef::release`] to observe eviction errors.
pub struct CacheRef<S: CacheSource> {
    cache: Arc<BoundedRefCache<S>>,
    key: S::Key,
    value: Option<Arc<S::Value>>,
}

impl<S: CacheSource> CacheRef<S> {
    fn new(cache: Arc<BoundedRefCache<S>>, key: S::Key, value: Arc<S::Value>) -> Self {
        Self {
            cache,
            key,
            value: Some(value),
        }
    }

    pub fn key(&self) -> S::Key {
        self.key
    }

    pub fn release(mut self) -> Result<()> {
        // The handle's Arc must go before the cache hands the value to evict.
        self.value.take();
        self.cache.release(self.key)
    }
}

impl<S: CacheSource> Deref for CacheRef<S> {
    type Target = S::Value;

    fn deref(&self) -> &Self::Target {
        match &self.value {
            Some(value) => value,
            None => unreachable!("cache reference used after release"),
        }
    }
}

impl<S: CacheSource> Drop for CacheRef<S> {
    fn drop(&mut self) {
        if self.value.take().is_some() {
            if let Err(e) = self.cache.release(self.key) {
                log::error!("failed to release cached resource {:?}: {}", self.key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingSource {
        loads: AtomicUsize,
        evictions: AtomicUsize,
        fail_key: Option<u64>,
    }

    impl CacheSource for CountingSource {
        type Key = u64;
        type Value = String;

        fn load(&self, key: u64) -> Result<String> {
            if self.fail_key == Some(key) {
                return Err(Error::NullEntry(crate::data::Uid::from_raw(key)));
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(format!("value-{}", key))
        }

        fn evict(&self, _key: u64, _value: Arc<String>) -> Result<()> {
            self.evictions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_get_and_release() {
        let cache = Arc::new(BoundedRefCache::new(CountingSource::default(), 4));

        let a = cache.get(1).unwrap();
        let b = cache.get(1).unwrap();
        assert_eq!(*a, "value-1");
        assert_eq!(cache.ref_count(1), 2);
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);

        drop(a);
        assert_eq!(cache.ref_count(1), 1);
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 0);

        b.release().unwrap();
        assert_eq!(cache.ref_count(1), 0);
        assert_eq!(cache.resident(), 0);
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_full() {
        let cache = Arc::new(BoundedRefCache::new(CountingSource::default(), 2));

        let _a = cache.get(1).unwrap();
        let _b = cache.get(2).unwrap();
        assert!(matches!(cache.get(3), Err(Error::CacheFull)));

        // Resident keys are still reachable when full.
        let again = cache.get(1).unwrap();
        assert_eq!(*again, "value-1");
    }

    #[test]
    fn test_unbounded_capacity() {
        let cache = Arc::new(BoundedRefCache::new(CountingSource::default(), 0));
        let handles: Vec<_> = (0..32).map(|k| cache.get(k).unwrap()).collect();
        assert_eq!(cache.resident(), 32);
        drop(handles);
        assert_eq!(cache.resident(), 0);
    }

    #[test]
    fn test_failed_load_frees_slot() {
        let source = CountingSource {
            fail_key: Some(9),
            ..Default::default()
        };
        let cache = Arc::new(BoundedRefCache::new(source, 1));

        assert!(cache.get(9).is_err());
        assert_eq!(cache.resident(), 0);
        assert!(cache.get(1).is_ok());
    }

    #[test]
    fn test_concurrent_get_loads_once() {
        let cache = Arc::new(BoundedRefCache::new(CountingSource::default(), 8));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let value = cache.get(42).unwrap();
                    assert_eq!(*value, "value-42");
                    value
                })
            })
            .collect();

        let refs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cache.source().loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.ref_count(42), 8);

        let mut refs = refs;
        while refs.len() > 1 {
            refs.pop();
            assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 0);
        }
        refs.pop();
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_evicts_everything() {
        let cache = Arc::new(BoundedRefCache::new(CountingSource::default(), 0));
        let a = cache.get(1).unwrap();
        let _b = cache.get(2).unwrap();

        cache.close().unwrap();
        assert_eq!(cache.resident(), 0);
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 2);

        // Handles outliving close release nothing twice.
        drop(a);
        assert_eq!(cache.source().evictions.load(Ordering::SeqCst), 2);
    }
}
