use std::any::Any;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::listener::{EvictionListener, EvictionReason};
use crate::lru_list::LruList;
use crate::metrics::{Metrics, MetricsConfig, MetricsSnapshot};
use crate::mode::ConstructionMode;
use crate::named_lock::NamedLocks;
use crate::CacheBuilder;

/// A failed construction, parked on the key's named lock so callers queued
/// behind it get the same error.
type SharedFailure = Arc<dyn Any + Send + Sync>;

/// The last failure on a key, tagged with the lock epoch it was recorded at.
type FailureSlot = Option<(u64, SharedFailure)>;

/// A staleness predicate evaluated against a cache hit.
pub(crate) type StalePredicate<'a, V> = &'a dyn Fn(&V) -> bool;

/// Outcome of looking a key up under the cache-wide lock.
enum Lookup<V> {
  Fresh(Arc<V>),
  Stale(Arc<V>),
  Missing,
}

/// A thread-safe, fixed-capacity LRU cache.
///
/// Misses can be filled through [`Cache::get_or_create`], whose behavior under
/// concurrent callers is governed by the cache's [`ConstructionMode`]. A cache
/// built with capacity 0 is a pass-through: `get_or_create` always runs the
/// constructor and every other operation is a no-op.
///
/// Values are stored as `Arc<V>` so no `V: Clone` bound is needed.
pub struct Cache<K, V, H = ahash::RandomState>
where
  K: Eq + Hash,
{
  store: Mutex<LruList<K, V, H>>,
  capacity: usize,
  mode: ConstructionMode,
  pub(crate) metrics: Metrics,
  key_locks: NamedLocks<K, FailureSlot>,
  listener: Option<Arc<dyn EvictionListener<K, V>>>,
}

impl<K, V> Cache<K, V, ahash::RandomState>
where
  K: Eq + Hash + Clone,
{
  /// Creates a cache with the default hasher and no eviction listener.
  pub fn new(capacity: usize, mode: ConstructionMode) -> Self {
    CacheBuilder::new().capacity(capacity).mode(mode).build()
  }
}

impl<K, V, H> Cache<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  pub(crate) fn from_parts(
    capacity: usize,
    mode: ConstructionMode,
    hasher: H,
    listener: Option<Arc<dyn EvictionListener<K, V>>>,
    max_age: Option<std::time::Duration>,
  ) -> Self {
    Self {
      store: Mutex::new(LruList::with_hasher(hasher)),
      capacity,
      mode,
      metrics: Metrics::new(MetricsConfig {
        max_items: capacity,
        max_age,
        mode: Some(mode),
      }),
      key_locks: NamedLocks::new(),
      listener,
    }
  }

  /// Whether caching is disabled (capacity 0).
  #[inline]
  fn is_pass_through(&self) -> bool {
    self.capacity == 0
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn mode(&self) -> ConstructionMode {
    self.mode
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  /// Returns the value for `key`, constructing it with `create` on a miss.
  ///
  /// The returned flag is `true` when inserting the new value evicted the
  /// least recently used entry. Construction errors are returned to the
  /// caller and never cached; in [`ConstructionMode::Decoupled`] every caller
  /// queued on the same key receives the same error.
  ///
  /// In [`ConstructionMode::Blocking`] the constructor runs under the
  /// cache-wide lock and must not call back into this cache.
  pub fn get_or_create<E, F>(&self, key: K, create: F) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Send + Sync + 'static,
  {
    self.get_or_create_inner(key, |k, _| create(k), None)
  }

  /// Like [`Cache::get_or_create`], but a hit for which `is_stale` returns
  /// `true` is treated as a miss and reconstructed.
  ///
  /// The stale value stays visible to other readers until its replacement is
  /// inserted. If the replacement fails, the stale entry is discarded.
  pub fn get_or_create_with<E, F, S>(
    &self,
    key: K,
    create: F,
    is_stale: S,
  ) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K) -> Result<V, E>,
    S: Fn(&V) -> bool,
    E: Send + Sync + 'static,
  {
    self.get_or_create_inner(key, |k, _| create(k), Some(&is_stale))
  }

  /// The construction entry point shared with the expiring cache. `create`
  /// also receives the stale value being replaced, if there is one.
  pub(crate) fn get_or_create_inner<E, F>(
    &self,
    key: K,
    create: F,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K, Option<&Arc<V>>) -> Result<V, E>,
    E: Send + Sync + 'static,
  {
    if self.is_pass_through() {
      return create(&key, None)
        .map(|value| (Arc::new(value), false))
        .map_err(Arc::new);
    }

    match self.mode {
      ConstructionMode::Blocking => self.create_blocking(key, create, is_stale),
      ConstructionMode::Concurrent => self.create_concurrent(key, create, is_stale),
      ConstructionMode::Decoupled => self.create_decoupled(key, create, is_stale),
    }
  }

  fn create_blocking<E, F>(
    &self,
    key: K,
    create: F,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K, Option<&Arc<V>>) -> Result<V, E>,
  {
    let mut store = self.store.lock();
    let previous = match Self::lookup(&mut store, &key, is_stale) {
      Lookup::Fresh(value) => {
        self.metrics.hit();
        return Ok((value, false));
      }
      Lookup::Stale(value) => Some(value),
      Lookup::Missing => None,
    };
    self.metrics.miss();

    match create(&key, previous.as_ref()) {
      Ok(value) => {
        let value = Arc::new(value);
        let evicted = self.insert_locked(&mut store, key, value.clone());
        drop(store);
        let was_evicted = evicted.is_some();
        self.notify(evicted, EvictionReason::Capacity);
        Ok((value, was_evicted))
      }
      Err(err) => {
        self.metrics.error();
        debug!(mode = %self.mode, "construction failed; nothing cached");
        let discarded = previous.and_then(|stale| self.discard_locked(&mut store, &key, &stale));
        drop(store);
        self.notify(discarded, EvictionReason::Expired);
        Err(Arc::new(err))
      }
    }
  }

  fn create_concurrent<E, F>(
    &self,
    key: K,
    create: F,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K, Option<&Arc<V>>) -> Result<V, E>,
  {
    let previous = match self.lookup_recording(&key, is_stale) {
      Ok(value) => return Ok((value, false)),
      Err(previous) => previous,
    };

    // Other callers missing on this key may be constructing at the same time.
    // Whoever inserts last wins in the cache; each caller keeps its own value.
    match create(&key, previous.as_ref()) {
      Ok(value) => {
        let value = Arc::new(value);
        Ok((value.clone(), self.insert(key, value)))
      }
      Err(err) => Err(self.construction_failed(&key, previous, err)),
    }
  }

  fn create_decoupled<E, F>(
    &self,
    key: K,
    create: F,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K, Option<&Arc<V>>) -> Result<V, E>,
    E: Send + Sync + 'static,
  {
    if let Ok(value) = self.lookup_recording(&key, is_stale) {
      return Ok((value, false));
    }

    let mut key_lock = self.key_locks.lock(&key);

    // Someone may have filled the key while we waited for its lock.
    let previous = {
      let mut store = self.store.lock();
      match Self::lookup(&mut store, &key, is_stale) {
        Lookup::Fresh(value) => {
          self.metrics.miss_to_hit();
          return Ok((value, false));
        }
        Lookup::Stale(value) => Some(value),
        Lookup::Missing => None,
      }
    };

    // A construction that failed while we were queued hands us its error.
    // Callers that arrived after the failure construct again.
    let joined = key_lock.joined_epoch();
    if let Some((failed_at, failure)) = key_lock.as_ref() {
      if joined < *failed_at {
        if let Ok(err) = Arc::clone(failure).downcast::<E>() {
          return Err(err);
        }
      }
    }

    match create(&key, previous.as_ref()) {
      Ok(value) => {
        let value = Arc::new(value);
        // Insert before the key lock is released so waiters find the value.
        let evicted = self.insert(key, value.clone());
        *key_lock = None;
        drop(key_lock);
        Ok((value, evicted))
      }
      Err(err) => {
        let err = self.construction_failed(&key, previous, err);
        let failed_at = key_lock.advance_epoch();
        *key_lock = Some((failed_at, err.clone() as SharedFailure));
        Err(err)
      }
    }
  }

  /// Looks `key` up under the cache-wide lock, recording a hit or a miss.
  /// On a miss, returns the stale value being replaced, if any.
  fn lookup_recording(
    &self,
    key: &K,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Result<Arc<V>, Option<Arc<V>>> {
    let mut store = self.store.lock();
    match Self::lookup(&mut store, key, is_stale) {
      Lookup::Fresh(value) => {
        self.metrics.hit();
        Ok(value)
      }
      Lookup::Stale(value) => {
        self.metrics.miss();
        Err(Some(value))
      }
      Lookup::Missing => {
        self.metrics.miss();
        Err(None)
      }
    }
  }

  fn lookup(
    store: &mut LruList<K, V, H>,
    key: &K,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Lookup<V> {
    match store.get(key) {
      Some(value) if is_stale.is_some_and(|stale| stale(value)) => Lookup::Stale(value.clone()),
      Some(value) => Lookup::Fresh(value.clone()),
      None => Lookup::Missing,
    }
  }

  fn construction_failed<E>(&self, key: &K, previous: Option<Arc<V>>, err: E) -> Arc<E> {
    self.metrics.error();
    debug!(mode = %self.mode, "construction failed; nothing cached");
    if let Some(stale) = previous {
      let discarded = {
        let mut store = self.store.lock();
        self.discard_locked(&mut store, key, &stale)
      };
      self.notify(discarded, EvictionReason::Expired);
    }
    Arc::new(err)
  }

  /// Inserts `value` as the most recently used entry, evicting the least
  /// recently used one if capacity is exceeded. Must be called under the
  /// cache-wide lock; the caller notifies the listener after unlocking.
  fn insert_locked(
    &self,
    store: &mut LruList<K, V, H>,
    key: K,
    value: Arc<V>,
  ) -> Option<(K, Arc<V>)> {
    if store.push_front(key, value).is_none() {
      self.metrics.added(1);
    }
    if store.len() > self.capacity {
      let evicted = store.pop_back();
      if evicted.is_some() {
        self.metrics.removed(1);
        trace!(capacity = self.capacity, "evicted least recently used entry");
      }
      evicted
    } else {
      None
    }
  }

  /// Removes `key` only if it still maps to `expected`.
  fn discard_locked(
    &self,
    store: &mut LruList<K, V, H>,
    key: &K,
    expected: &Arc<V>,
  ) -> Option<(K, Arc<V>)> {
    let same = store
      .peek(key)
      .is_some_and(|current| Arc::ptr_eq(current, expected));
    if !same {
      return None;
    }
    let removed = store.remove(key)?;
    self.metrics.removed(1);
    Some((key.clone(), removed))
  }

  fn insert(&self, key: K, value: Arc<V>) -> bool {
    let evicted = {
      let mut store = self.store.lock();
      self.insert_locked(&mut store, key, value)
    };
    let was_evicted = evicted.is_some();
    self.notify(evicted, EvictionReason::Capacity);
    was_evicted
  }

  fn notify<I>(&self, removed: I, reason: EvictionReason)
  where
    I: IntoIterator<Item = (K, Arc<V>)>,
  {
    if let Some(listener) = &self.listener {
      for (key, value) in removed {
        listener.on_evict(key, value, reason);
      }
    }
  }

  /// Adds a value, replacing any existing one. Returns `true` if an
  /// eviction occurred.
  pub fn add(&self, key: K, value: V) -> bool {
    self.add_arc(key, Arc::new(value))
  }

  pub(crate) fn add_arc(&self, key: K, value: Arc<V>) -> bool {
    if self.is_pass_through() {
      return false;
    }
    self.insert(key, value)
  }

  /// Looks up a key, marking it most recently used on a hit.
  pub fn get(&self, key: &K) -> Option<Arc<V>> {
    if self.is_pass_through() {
      return None;
    }
    let found = self.store.lock().get(key).cloned();
    match found {
      Some(_) => self.metrics.hit(),
      None => self.metrics.miss(),
    }
    found
  }

  /// Looks up a key without updating its recency or the hit/miss counters.
  pub fn peek(&self, key: &K) -> Option<Arc<V>> {
    if self.is_pass_through() {
      return None;
    }
    self.store.lock().peek(key).cloned()
  }

  /// Like `get`, but leaves the hit/miss counters to the caller.
  pub(crate) fn touch(&self, key: &K) -> Option<Arc<V>> {
    if self.is_pass_through() {
      return None;
    }
    self.store.lock().get(key).cloned()
  }

  /// Checks for a key without updating its recency.
  pub fn contains(&self, key: &K) -> bool {
    !self.is_pass_through() && self.store.lock().contains(key)
  }

  /// Adds the value only if the key is absent.
  ///
  /// Returns `(contained, evicted)`: whether the key was already present
  /// (in which case nothing changed) and whether adding caused an eviction.
  pub fn contains_or_add(&self, key: K, value: V) -> (bool, bool) {
    if self.is_pass_through() {
      return (false, false);
    }
    let evicted = {
      let mut store = self.store.lock();
      if store.contains(&key) {
        return (true, false);
      }
      self.insert_locked(&mut store, key, Arc::new(value))
    };
    let was_evicted = evicted.is_some();
    self.notify(evicted, EvictionReason::Capacity);
    (false, was_evicted)
  }

  /// Removes a key. Returns `true` if it was present.
  pub fn remove(&self, key: &K) -> bool {
    if self.is_pass_through() {
      return false;
    }
    let removed = self.store.lock().remove(key);
    match removed {
      Some(value) => {
        self.metrics.removed(1);
        self.notify(Some((key.clone(), value)), EvictionReason::Invalidated);
        true
      }
      None => false,
    }
  }

  /// Removes `key` only if it still holds `expected`.
  pub(crate) fn remove_if_same(&self, key: &K, expected: &Arc<V>, reason: EvictionReason) -> bool {
    if self.is_pass_through() {
      return false;
    }
    let removed = {
      let mut store = self.store.lock();
      self.discard_locked(&mut store, key, expected)
    };
    let was_removed = removed.is_some();
    self.notify(removed, reason);
    was_removed
  }

  /// Removes every entry matching `predicate`, returning how many were removed.
  pub(crate) fn remove_where<F>(&self, predicate: F, reason: EvictionReason) -> usize
  where
    F: FnMut(&K, &Arc<V>) -> bool,
  {
    if self.is_pass_through() {
      return 0;
    }
    let removed = self.store.lock().remove_where(predicate);
    let count = removed.len();
    self.metrics.removed(count as u64);
    self.notify(removed, reason);
    count
  }

  /// Removes and returns the least recently used entry.
  pub fn remove_oldest(&self) -> Option<(K, Arc<V>)> {
    if self.is_pass_through() {
      return None;
    }
    let (key, value) = self.store.lock().pop_back()?;
    self.metrics.removed(1);
    self.notify(
      Some((key.clone(), value.clone())),
      EvictionReason::Invalidated,
    );
    Some((key, value))
  }

  /// Returns the least recently used entry without removing or touching it.
  pub fn get_oldest(&self) -> Option<(K, Arc<V>)> {
    if self.is_pass_through() {
      return None;
    }
    self
      .store
      .lock()
      .peek_back()
      .map(|(key, value)| (key.clone(), value.clone()))
  }

  /// Removes every entry.
  pub fn purge(&self) {
    if self.is_pass_through() {
      return;
    }
    let drained = self.store.lock().drain();
    self.metrics.removed(drained.len() as u64);
    self.notify(drained, EvictionReason::Invalidated);
  }

  /// Keys ordered from least to most recently used.
  pub fn keys(&self) -> Vec<K> {
    if self.is_pass_through() {
      return Vec::new();
    }
    self.store.lock().keys()
  }

  pub fn len(&self) -> usize {
    if self.is_pass_through() {
      return 0;
    }
    self.store.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[cfg(test)]
  pub(crate) fn pending_key_locks(&self) -> usize {
    self.key_locks.len()
  }
}

impl<K, V, H> fmt::Debug for Cache<K, V, H>
where
  K: Eq + Hash,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache")
      .field("capacity", &self.capacity)
      .field("mode", &self.mode)
      .field("metrics", &self.metrics.snapshot())
      .finish_non_exhaustive()
  }
}
