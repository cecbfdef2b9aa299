use crate::cache::Cache;
use crate::entry::ExpiringEntry;
use crate::error::BuildError;
use crate::expiring::{AgePolicy, ExpiringCache, ExpiringListener};
use crate::mode::ConstructionMode;
use crate::ref_cache::{RefCache, Resource};
use crate::time::{Clock, SystemClock};
use crate::{CacheConfig, EvictionListener};

use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// A builder for [`Cache`].
pub struct CacheBuilder<K, V, H = ahash::RandomState> {
  capacity: usize,
  mode: ConstructionMode,
  hasher: H,
  listener: Option<Arc<dyn EvictionListener<K, V>>>,
}

// Manual Debug implementation for CacheBuilder.
impl<K, V, H> fmt::Debug for CacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("capacity", &self.capacity)
      .field("mode", &self.mode)
      .field("has_listener", &self.listener.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V, H: Default> CacheBuilder<K, V, H> {
  /// Creates a builder for a disabled (capacity 0), decoupled cache.
  pub fn new() -> Self {
    Self {
      capacity: 0,
      mode: ConstructionMode::default(),
      hasher: H::default(),
      listener: None,
    }
  }
}

impl<K, V> Default for CacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, H> CacheBuilder<K, V, H> {
  /// Sets the maximum number of entries. Zero turns the cache into a
  /// pass-through.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  pub fn mode(mut self, mode: ConstructionMode) -> Self {
    self.mode = mode;
    self
  }

  /// Applies `max_items` and `mode` from a config.
  pub fn config(self, config: &CacheConfig) -> Self {
    self.capacity(config.max_items).mode(config.mode)
  }

  /// Sets a listener called for every entry that leaves the cache.
  pub fn eviction_listener<Listener>(mut self, listener: Listener) -> Self
  where
    Listener: EvictionListener<K, V> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Sets the hasher for the cache.
  pub fn hasher<H2>(self, hasher: H2) -> CacheBuilder<K, V, H2> {
    CacheBuilder {
      capacity: self.capacity,
      mode: self.mode,
      hasher,
      listener: self.listener,
    }
  }
}

impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  pub fn build(self) -> Cache<K, V, H> {
    Cache::from_parts(self.capacity, self.mode, self.hasher, self.listener, None)
  }
}

/// A builder for [`ExpiringCache`].
pub struct ExpiringCacheBuilder<K, V, H = ahash::RandomState> {
  inner: CacheBuilder<K, V, H>,
  max_age: Option<Duration>,
  reset_age_on_access: bool,
  reset_age_after_creation: bool,
  serve_stale_during_refresh: bool,
  clock: Arc<dyn Clock>,
}

impl<K, V, H> fmt::Debug for ExpiringCacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExpiringCacheBuilder")
      .field("inner", &self.inner)
      .field("max_age", &self.max_age)
      .field("reset_age_on_access", &self.reset_age_on_access)
      .field("reset_age_after_creation", &self.reset_age_after_creation)
      .field("serve_stale_during_refresh", &self.serve_stale_during_refresh)
      .finish_non_exhaustive()
  }
}

impl<K, V, H: Default> ExpiringCacheBuilder<K, V, H> {
  pub fn new() -> Self {
    Self {
      inner: CacheBuilder::new(),
      max_age: None,
      reset_age_on_access: false,
      reset_age_after_creation: false,
      serve_stale_during_refresh: false,
      clock: Arc::new(SystemClock),
    }
  }
}

impl<K, V> Default for ExpiringCacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, H> ExpiringCacheBuilder<K, V, H> {
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.inner = self.inner.capacity(capacity);
    self
  }

  pub fn mode(mut self, mode: ConstructionMode) -> Self {
    self.inner = self.inner.mode(mode);
    self
  }

  /// Sets how long an entry stays fresh. Required.
  pub fn max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
    self
  }

  /// Restarts an entry's age on every successful read (sliding expiration).
  pub fn reset_age_on_access(mut self, enabled: bool) -> Self {
    self.reset_age_on_access = enabled;
    self
  }

  /// Measures an entry's age from when its construction finished rather
  /// than from when it started.
  pub fn reset_age_after_creation(mut self, enabled: bool) -> Self {
    self.reset_age_after_creation = enabled;
    self
  }

  /// Serves an expired value while another caller is rebuilding it.
  pub fn serve_stale_during_refresh(mut self, enabled: bool) -> Self {
    self.serve_stale_during_refresh = enabled;
    self
  }

  /// Replaces the system clock, e.g. with a [`crate::ManualClock`].
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Applies every setting present in a config.
  pub fn config(mut self, config: &CacheConfig) -> Self {
    self.inner = self.inner.config(config);
    self.max_age = config.max_age.or(self.max_age);
    self.reset_age_on_access = config.reset_age_on_access;
    self.reset_age_after_creation = config.reset_age_after_creation;
    self.serve_stale_during_refresh = config.serve_stale_during_refresh;
    self
  }

  pub fn eviction_listener<Listener>(mut self, listener: Listener) -> Self
  where
    Listener: EvictionListener<K, V> + 'static,
  {
    self.inner = self.inner.eviction_listener(listener);
    self
  }

  pub fn hasher<H2>(self, hasher: H2) -> ExpiringCacheBuilder<K, V, H2> {
    ExpiringCacheBuilder {
      inner: self.inner.hasher(hasher),
      max_age: self.max_age,
      reset_age_on_access: self.reset_age_on_access,
      reset_age_after_creation: self.reset_age_after_creation,
      serve_stale_during_refresh: self.serve_stale_during_refresh,
      clock: self.clock,
    }
  }
}

impl<K, V, H> ExpiringCacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + 'static,
  V: 'static,
  H: BuildHasher,
{
  pub fn build(self) -> Result<ExpiringCache<K, V, H>, BuildError> {
    let max_age = self.max_age.ok_or(BuildError::MissingMaxAge)?;
    if max_age.is_zero() {
      return Err(BuildError::ZeroMaxAge(max_age));
    }

    let CacheBuilder {
      capacity,
      mode,
      hasher,
      listener,
    } = self.inner;
    let listener = listener.map(|listener| {
      Arc::new(ExpiringListener(listener)) as Arc<dyn EvictionListener<K, ExpiringEntry<V>>>
    });
    let cache = Cache::from_parts(capacity, mode, hasher, listener, Some(max_age));

    let policy = AgePolicy {
      max_age,
      reset_age_on_access: self.reset_age_on_access,
      reset_age_after_creation: self.reset_age_after_creation,
      serve_stale_during_refresh: self.serve_stale_during_refresh,
    };
    Ok(ExpiringCache::from_parts(cache, policy, self.clock))
  }
}

/// A builder for [`RefCache`].
pub struct RefCacheBuilder<K, R, H = ahash::RandomState> {
  capacity: usize,
  hasher: H,
  _marker: PhantomData<fn() -> (K, R)>,
}

impl<K, R, H> fmt::Debug for RefCacheBuilder<K, R, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefCacheBuilder")
      .field("capacity", &self.capacity)
      .finish_non_exhaustive()
  }
}

impl<K, R, H: Default> RefCacheBuilder<K, R, H> {
  pub fn new() -> Self {
    Self {
      capacity: 0,
      hasher: H::default(),
      _marker: PhantomData,
    }
  }
}

impl<K, R> Default for RefCacheBuilder<K, R, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, R, H> RefCacheBuilder<K, R, H> {
  /// Sets how many resources the cache keeps open. Active resources count
  /// against it when a new resource is opened: the oldest idle ones are
  /// closed while active plus idle would reach `capacity`. A release keeps
  /// at most `capacity` idle resources. Active resources are never closed
  /// to make room. Zero closes resources as soon as their last reference is
  /// released.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  /// Applies `max_items` from a config.
  pub fn config(self, config: &CacheConfig) -> Self {
    self.capacity(config.max_items)
  }

  pub fn hasher<H2>(self, hasher: H2) -> RefCacheBuilder<K, R, H2> {
    RefCacheBuilder {
      capacity: self.capacity,
      hasher,
      _marker: PhantomData,
    }
  }
}

impl<K, R, H> RefCacheBuilder<K, R, H>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher + Clone,
{
  pub fn build(self) -> RefCache<K, R, H> {
    RefCache::from_parts(self.capacity, self.hasher)
  }
}
