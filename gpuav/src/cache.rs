use foldhash::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    hash::Hash,
    sync::{Arc, Weak},
};

/// A map whose values are built at most once per key, possibly concurrently.
///
/// Every entry goes through `Unbuilt → Building → Ready | Failed`. The map itself is locked only
/// to find the entry; the build runs under no lock at all, and other callers asking for the same
/// key wait on the entry's condition variable until the build has finished. Callers asking for
/// different keys never wait on each other's builds.
///
/// A failed build is sticky: later callers observe the same error without building again.
#[derive(Debug)]
pub(crate) struct OnceCache<K, V, E> {
    inner: RwLock<HashMap<K, Arc<OnceEntry<V, E>>>>,
}

#[derive(Debug)]
struct OnceEntry<V, E> {
    state: Mutex<BuildState<V, E>>,
    built: Condvar,
}

#[derive(Debug)]
enum BuildState<V, E> {
    Unbuilt,
    Building,
    Ready(V),
    Failed(E),
}

impl<K, V, E> Default for OnceCache<K, V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> OnceCache<K, V, E> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }
}

impl<K, V, E> OnceCache<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: Clone,
{
    /// Returns the value for `key`, building it with `f` if no other caller has. If `f` fails, the
    /// error is stored and returned to every later caller.
    pub(crate) fn get_or_try_build(&self, key: &K, f: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        let entry = self.entry(key);

        {
            let mut state = entry.state.lock();

            loop {
                match &*state {
                    BuildState::Ready(value) => return Ok(value.clone()),
                    BuildState::Failed(err) => return Err(err.clone()),
                    BuildState::Building => entry.built.wait(&mut state),
                    BuildState::Unbuilt => {
                        *state = BuildState::Building;
                        break;
                    }
                }
            }
        }

        let guard = BuildGuard { entry: &entry };
        let result = f();
        guard.finish(match &result {
            Ok(value) => BuildState::Ready(value.clone()),
            Err(err) => BuildState::Failed(err.clone()),
        });

        result
    }

    fn entry(&self, key: &K) -> Arc<OnceEntry<V, E>> {
        if let Some(entry) = self.inner.read().get(key) {
            return entry.clone();
        }

        self.inner
            .write()
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(OnceEntry {
                    state: Mutex::new(BuildState::Unbuilt),
                    built: Condvar::new(),
                })
            })
            .clone()
    }
}

/// Publishes the outcome of a build. If the build unwinds instead, the entry goes back to
/// `Unbuilt` so that a waiter can take over.
struct BuildGuard<'a, V, E> {
    entry: &'a OnceEntry<V, E>,
}

impl<V, E> BuildGuard<'_, V, E> {
    fn finish(self, state: BuildState<V, E>) {
        *self.entry.state.lock() = state;
        self.entry.built.notify_all();
        std::mem::forget(self);
    }
}

impl<V, E> Drop for BuildGuard<'_, V, E> {
    fn drop(&mut self) {
        *self.entry.state.lock() = BuildState::Unbuilt;
        self.entry.built.notify_all();
    }
}

/// Like `OnceCache`, but the cache stores weak `Arc` references. If the weak reference cannot
/// be upgraded, then it acts as if the entry has become vacant again.
///
/// Values are created under a lock that is specific to the key, so two threads creating the same
/// value run `f` once between them while creations for other keys proceed in parallel.
#[derive(Debug)]
pub(crate) struct WeakArcOnceCache<K, V> {
    inner: Mutex<HashMap<K, Arc<Mutex<Weak<V>>>>>,
}

impl<K, V> Default for WeakArcOnceCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WeakArcOnceCache<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::default()),
        }
    }
}

impl<K, V> WeakArcOnceCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Returns the value for the specified `key`. The entry gets written to with the value
    /// returned by `f` if it doesn't exist. If `f` returns [`Err`], the error is propagated and
    /// the entry isn't written to.
    pub(crate) fn get_or_try_insert<E>(
        &self,
        key: K,
        f: impl FnOnce(&K) -> Result<Arc<V>, E>,
    ) -> Result<Arc<V>, E> {
        let slot = {
            let mut inner = self.inner.lock();

            // Entries whose value is gone would otherwise pile up for every distinct module.
            if inner.len() >= 64 && inner.len().is_power_of_two() {
                inner.retain(|_, slot| slot.try_lock().is_none_or(|weak| weak.strong_count() != 0));
            }

            inner.entry(key.clone()).or_default().clone()
        };

        let mut weak = slot.lock();

        if let Some(arc) = weak.upgrade() {
            return Ok(arc);
        }

        let arc = f(&key)?;
        *weak = Arc::downgrade(&arc);

        Ok(arc)
    }

    /// Returns the number of live values.
    pub(crate) fn live_count(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|slot| slot.lock().strong_count() != 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::{OnceCache, WeakArcOnceCache};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Barrier,
    };

    #[test]
    fn builds_once_across_threads() {
        let cache = Arc::new(OnceCache::<u32, Arc<u32>, ()>::new());
        let builds = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let builds = builds.clone();
                let barrier = barrier.clone();

                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_try_build(&7, || {
                            builds.fetch_add(1, Ordering::Relaxed);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(Arc::new(49))
                        })
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(builds.load(Ordering::Relaxed), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
    }

    #[test]
    fn failure_is_sticky() {
        let cache = OnceCache::<u32, u32, &'static str>::new();

        assert_eq!(cache.get_or_try_build(&1, || Err("broken")), Err("broken"));
        assert_eq!(cache.get_or_try_build(&1, || Ok(5)), Err("broken"));
        assert_eq!(cache.get_or_try_build(&2, || Ok(5)), Ok(5));
        assert_eq!(cache.get_or_try_build(&2, || Ok(6)), Ok(5));
    }

    #[test]
    fn panicking_build_can_be_retried() {
        let cache = OnceCache::<u32, u32, ()>::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.get_or_try_build(&1, || panic!("build panicked"))
        }));
        assert!(result.is_err());

        assert_eq!(cache.get_or_try_build(&1, || Ok(3)), Ok(3));
    }

    #[test]
    fn weak_entries_expire() {
        let cache = WeakArcOnceCache::<u32, String>::new();

        let first = cache
            .get_or_try_insert(1, |_| Ok::<_, ()>(Arc::new("a".to_owned())))
            .unwrap();
        let again = cache
            .get_or_try_insert(1, |_| Ok::<_, ()>(Arc::new("b".to_owned())))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(cache.live_count(), 1);

        drop(first);
        drop(again);
        assert_eq!(cache.live_count(), 0);

        let rebuilt = cache
            .get_or_try_insert(1, |_| Ok::<_, ()>(Arc::new("c".to_owned())))
            .unwrap();
        assert_eq!(*rebuilt, "c");
    }
}
