use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Cache, StalePredicate};
use crate::entry::ExpiringEntry;
use crate::error::BuildError;
use crate::listener::{EvictionListener, EvictionReason};
use crate::metrics::MetricsSnapshot;
use crate::mode::ConstructionMode;
use crate::time::Clock;
use crate::ExpiringCacheBuilder;

/// How an expiring cache ages its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AgePolicy {
  pub(crate) max_age: Duration,
  pub(crate) reset_age_on_access: bool,
  pub(crate) reset_age_after_creation: bool,
  pub(crate) serve_stale_during_refresh: bool,
}

/// A bounded LRU cache whose entries go stale once they reach a max age.
///
/// Expiration is lazy: a stale entry is rebuilt (or dropped) the next time it
/// is looked up, or when [`ExpiringCache::evict_expired`] sweeps the cache.
///
/// With `serve_stale_during_refresh`, a caller that finds an expired entry
/// already being rebuilt by someone else gets the old value right away
/// instead of waiting. This is mostly useful with
/// [`ConstructionMode::Decoupled`], where waiting would otherwise mean
/// queueing on the key's lock.
pub struct ExpiringCache<K, V, H = ahash::RandomState>
where
  K: Eq + Hash,
{
  cache: Cache<K, ExpiringEntry<V>, H>,
  policy: AgePolicy,
  clock: Arc<dyn Clock>,
}

impl<K, V> ExpiringCache<K, V, ahash::RandomState>
where
  K: Eq + Hash + Clone + 'static,
  V: 'static,
{
  /// Creates an expiring cache with the system clock and default toggles.
  pub fn new(capacity: usize, mode: ConstructionMode, max_age: Duration) -> Result<Self, BuildError> {
    ExpiringCacheBuilder::new()
      .capacity(capacity)
      .mode(mode)
      .max_age(max_age)
      .build()
  }
}

impl<K, V, H> ExpiringCache<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  pub(crate) fn from_parts(
    cache: Cache<K, ExpiringEntry<V>, H>,
    policy: AgePolicy,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      cache,
      policy,
      clock,
    }
  }

  pub fn max_age(&self) -> Duration {
    self.policy.max_age
  }

  pub fn capacity(&self) -> usize {
    self.cache.capacity()
  }

  pub fn mode(&self) -> ConstructionMode {
    self.cache.mode()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.cache.metrics()
  }

  #[inline]
  fn is_expired(&self, entry: &ExpiringEntry<V>) -> bool {
    entry.is_expired(self.clock.now(), self.policy.max_age)
  }

  /// Returns the value for `key`, constructing it with `create` if it is
  /// missing or has reached its max age.
  ///
  /// The returned flag is `true` when inserting the new value evicted the
  /// least recently used entry.
  pub fn get_or_create<E, F>(&self, key: K, create: F) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Send + Sync + 'static,
  {
    self.get_or_create_inner(key, create, None)
  }

  /// Like [`ExpiringCache::get_or_create`], but an unexpired entry for which
  /// `is_stale` returns `true` is also rebuilt.
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
    self.get_or_create_inner(key, create, Some(&is_stale))
  }

  fn get_or_create_inner<E, F>(
    &self,
    key: K,
    create: F,
    is_stale: Option<StalePredicate<'_, V>>,
  ) -> Result<(Arc<V>, bool), Arc<E>>
  where
    F: FnOnce(&K) -> Result<V, E>,
    E: Send + Sync + 'static,
  {
    if self.policy.serve_stale_during_refresh {
      // A stale hit still counts as a use of the key.
      if let Some(entry) = self.cache.touch(&key) {
        if entry.is_refreshing() && self.is_expired(&entry) {
          self.cache.metrics.stale_hit();
          return Ok((entry.value(), false));
        }
      }
    }

    let needs_rebuild = |entry: &ExpiringEntry<V>| {
      self.is_expired(entry) || is_stale.is_some_and(|stale| stale(entry.value_ref()))
    };

    let mut created = false;
    let (entry, evicted) = self.cache.get_or_create_inner::<E, _>(
      key,
      |k, previous| {
        created = true;
        let _refresh = previous.map(|entry| entry.begin_refresh());
        let started = self.clock.now();
        let value = create(k)?;
        let stamp = if self.policy.reset_age_after_creation {
          self.clock.now()
        } else {
          started
        };
        Ok(ExpiringEntry::new(Arc::new(value), stamp))
      },
      Some(&needs_rebuild),
    )?;

    if !created && self.policy.reset_age_on_access {
      entry.touch(self.clock.now());
    }
    Ok((entry.value(), evicted))
  }

  /// Looks up a key without constructing anything.
  ///
  /// An expired entry counts as a miss and is dropped, unless a refresh is
  /// in flight, in which case it is served when stale serving is enabled.
  pub fn get(&self, key: &K) -> Option<Arc<V>> {
    if self.cache.capacity() == 0 {
      return None;
    }
    let metrics = &self.cache.metrics;
    let Some(entry) = self.cache.touch(key) else {
      metrics.miss();
      return None;
    };

    if !self.is_expired(&entry) {
      metrics.hit();
      if self.policy.reset_age_on_access {
        entry.touch(self.clock.now());
      }
      return Some(entry.value());
    }

    if entry.is_refreshing() {
      if self.policy.serve_stale_during_refresh {
        metrics.stale_hit();
        return Some(entry.value());
      }
      metrics.miss();
      return None;
    }

    metrics.miss();
    self
      .cache
      .remove_if_same(key, &entry, EvictionReason::Expired);
    None
  }

  /// Adds a value with a fresh age, replacing any existing one. Returns
  /// `true` if an eviction occurred.
  pub fn add(&self, key: K, value: V) -> bool {
    let entry = ExpiringEntry::new(Arc::new(value), self.clock.now());
    self.cache.add_arc(key, Arc::new(entry))
  }

  /// Checks for an unexpired entry without touching recency, age or metrics.
  pub fn contains(&self, key: &K) -> bool {
    self
      .cache
      .peek(key)
      .is_some_and(|entry| !self.is_expired(&entry))
  }

  /// Removes a key. Returns `true` if it was present.
  pub fn remove(&self, key: &K) -> bool {
    self.cache.remove(key)
  }

  /// Removes every expired entry that is not being refreshed and returns how
  /// many were removed.
  pub fn evict_expired(&self) -> usize {
    let now = self.clock.now();
    let max_age = self.policy.max_age;
    self.cache.remove_where(
      |_, entry| entry.is_expired(now, max_age) && !entry.is_refreshing(),
      EvictionReason::Expired,
    )
  }

  /// Removes every entry.
  pub fn purge(&self) {
    self.cache.purge()
  }

  /// Keys ordered from least to most recently used, expired ones included.
  pub fn keys(&self) -> Vec<K> {
    self.cache.keys()
  }

  /// The number of entries, expired ones included.
  pub fn len(&self) -> usize {
    self.cache.len()
  }

  pub fn is_empty(&self) -> bool {
    self.cache.is_empty()
  }
}

impl<K, V, H> fmt::Debug for ExpiringCache<K, V, H>
where
  K: Eq + Hash,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExpiringCache")
      .field("cache", &self.cache)
      .field("policy", &self.policy)
      .finish_non_exhaustive()
  }
}

/// Hands the user's listener the plain value instead of the internal entry.
pub(crate) struct ExpiringListener<K, V>(pub(crate) Arc<dyn EvictionListener<K, V>>);

impl<K, V> EvictionListener<K, ExpiringEntry<V>> for ExpiringListener<K, V> {
  fn on_evict(&self, key: K, entry: Arc<ExpiringEntry<V>>, reason: EvictionReason) {
    self.0.on_evict(key, entry.value(), reason)
  }
}
