use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tracing::{debug, error, trace, warn};

use crate::lru_list::LruList;
use crate::metrics::{Metrics, MetricsConfig, MetricsSnapshot};
use crate::RefCacheBuilder;

/// A value with an explicit release step, managed by a [`RefCache`].
///
/// Opening is done by the constructor passed to [`RefCache::get_or_create`];
/// `close` is called exactly once, after the last reference has been released
/// and the resource has been evicted from the idle tier (or purged).
pub trait Resource: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  fn close(&self) -> Result<(), Self::Error>;
}

const PENDING: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

enum SlotState<R: Resource> {
  Pending,
  Ready(Arc<R>),
  Failed(Arc<R::Error>),
}

/// One construction generation of a resource.
///
/// `state` doubles as the entry's own lock: the constructing caller holds it
/// for the whole construction, so everyone else who finds the entry blocks on
/// it until the outcome is known.
struct ResourceSlot<R: Resource> {
  state: Arc<Mutex<SlotState<R>>>,
  // Mirrors `state` so it can be checked without taking the entry lock.
  phase: AtomicU8,
  closed: AtomicBool,
}

impl<R: Resource> ResourceSlot<R> {
  fn pending() -> Self {
    Self {
      state: Arc::new(Mutex::new(SlotState::Pending)),
      phase: AtomicU8::new(PENDING),
      closed: AtomicBool::new(false),
    }
  }

  fn is_ready(&self) -> bool {
    self.phase.load(Ordering::Acquire) == READY
  }

  fn complete(
    &self,
    guard: &mut ArcMutexGuard<RawMutex, SlotState<R>>,
    outcome: Result<Arc<R>, Arc<R::Error>>,
  ) {
    match outcome {
      Ok(resource) => {
        **guard = SlotState::Ready(resource);
        self.phase.store(READY, Ordering::Release);
      }
      Err(err) => {
        **guard = SlotState::Failed(err);
        self.phase.store(FAILED, Ordering::Release);
      }
    }
  }

  /// Blocks until construction finished. `None` means the constructing
  /// caller went away (panicked) without an outcome.
  fn wait(&self) -> Option<Result<Arc<R>, Arc<R::Error>>> {
    match &*self.state.lock() {
      SlotState::Pending => None,
      SlotState::Ready(resource) => Some(Ok(resource.clone())),
      SlotState::Failed(err) => Some(Err(err.clone())),
    }
  }

  /// Closes the resource once; later calls are no-ops. Waits for an
  /// in-flight construction to finish first.
  fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let resource = match &*self.state.lock() {
      SlotState::Ready(resource) => resource.clone(),
      SlotState::Pending | SlotState::Failed(_) => return,
    };
    match resource.close() {
      Ok(()) => trace!("closed cached resource"),
      Err(err) => warn!(error = %err, "closing cached resource failed"),
    }
  }
}

struct ActiveEntry<R: Resource> {
  ref_count: usize,
  slot: Arc<ResourceSlot<R>>,
}

struct Tiers<K, R: Resource, H> {
  active: HashMap<K, ActiveEntry<R>, H>,
  idle: LruList<K, ResourceSlot<R>, H>,
}

enum Claim<R: Resource> {
  Existing(Arc<ResourceSlot<R>>),
  Construct(Arc<ResourceSlot<R>>, ArcMutexGuard<RawMutex, SlotState<R>>),
}

/// A two-tier, reference-counted cache for resources that must be closed.
///
/// Resources in use live in the *active* tier with a reference count of at
/// least one. When the count drops to zero they move to the bounded *idle*
/// tier, where they can be picked up again without reopening.
///
/// Only idle resources are ever evicted. The least recently released one is
/// closed when the idle tier overflows, or when a new resource is opened
/// while the cache already holds `capacity` resources in total. Active
/// resources are exempt, so the cache can grow past `capacity` while they are
/// in use.
///
/// Every successful [`RefCache::get_or_create`] must be paired with one
/// [`RefCache::release`] for the same key. Callers that get an error hold no
/// reference.
pub struct RefCache<K, R, H = ahash::RandomState>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher,
{
  tiers: Mutex<Tiers<K, R, H>>,
  capacity: usize,
  metrics: Metrics,
}

impl<K, R> RefCache<K, R, ahash::RandomState>
where
  K: Eq + Hash + Clone,
  R: Resource,
{
  /// Creates a cache holding up to `capacity` resources, active and idle.
  pub fn new(capacity: usize) -> Self {
    RefCacheBuilder::new().capacity(capacity).build()
  }
}

impl<K, R, H> RefCache<K, R, H>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher + Clone,
{
  pub(crate) fn from_parts(capacity: usize, hasher: H) -> Self {
    Self {
      tiers: Mutex::new(Tiers {
        active: HashMap::with_hasher(hasher.clone()),
        idle: LruList::with_hasher(hasher),
      }),
      capacity,
      metrics: Metrics::new(MetricsConfig {
        max_items: capacity,
        max_age: None,
        mode: None,
      }),
    }
  }

  /// Returns the resource for `key`, opening it with `open` if it is neither
  /// active nor idle, and takes a reference on it.
  ///
  /// Concurrent callers for the same key share one construction. If it
  /// fails, they all receive the same error and no entry is left behind.
  pub fn get_or_create<F>(&self, key: K, open: F) -> Result<Arc<R>, Arc<R::Error>>
  where
    F: FnOnce(&K) -> Result<R, R::Error>,
  {
    loop {
      let (claim, evicted) = self.claim(&key);
      self.close_evicted(evicted);
      match claim {
        Claim::Existing(slot) => match slot.wait() {
          Some(outcome) => return outcome,
          // The constructing caller unwound; its placeholder is on its way out.
          None => thread::yield_now(),
        },
        Claim::Construct(slot, guard) => return self.construct(key, slot, guard, open),
      }
    }
  }

  /// Takes a reference on `key` under the cache-wide lock. Also returns the
  /// idle resources evicted to make room for a new entry, to be closed once
  /// the lock is released.
  fn claim(&self, key: &K) -> (Claim<R>, Vec<Arc<ResourceSlot<R>>>) {
    let mut tiers = self.tiers.lock();

    if let Some(active) = tiers.active.get_mut(key) {
      active.ref_count += 1;
      self.metrics.hit();
      return (Claim::Existing(active.slot.clone()), Vec::new());
    }

    if let Some(slot) = tiers.idle.remove(key) {
      trace!("reactivating idle resource");
      tiers.active.insert(
        key.clone(),
        ActiveEntry {
          ref_count: 1,
          slot: slot.clone(),
        },
      );
      self.metrics.hit();
      return (Claim::Existing(slot), Vec::new());
    }

    self.metrics.miss();
    // Active entries are never evicted; idle ones give way to a newcomer.
    let mut evicted = Vec::new();
    while tiers.active.len() + tiers.idle.len() >= self.capacity {
      let Some((_, slot)) = tiers.idle.pop_back() else {
        break;
      };
      evicted.push(slot);
    }

    let slot = Arc::new(ResourceSlot::pending());
    // Uncontended: nobody else can see this slot yet.
    let guard = slot.state.lock_arc();
    tiers.active.insert(
      key.clone(),
      ActiveEntry {
        ref_count: 1,
        slot: slot.clone(),
      },
    );
    self.metrics.added(1);
    (Claim::Construct(slot, guard), evicted)
  }

  fn close_evicted(&self, evicted: Vec<Arc<ResourceSlot<R>>>) {
    if evicted.is_empty() {
      return;
    }
    self.metrics.removed(evicted.len() as u64);
    debug!(
      count = evicted.len(),
      capacity = self.capacity,
      "closing idle resources to make room"
    );
    for slot in evicted {
      slot.close();
    }
  }

  fn construct<F>(
    &self,
    key: K,
    slot: Arc<ResourceSlot<R>>,
    mut guard: ArcMutexGuard<RawMutex, SlotState<R>>,
    open: F,
  ) -> Result<Arc<R>, Arc<R::Error>>
  where
    F: FnOnce(&K) -> Result<R, R::Error>,
  {
    let mut placeholder = Placeholder {
      cache: self,
      key: &key,
      slot: &slot,
      armed: true,
    };

    match open(&key) {
      Ok(resource) => {
        let resource = Arc::new(resource);
        slot.complete(&mut guard, Ok(resource.clone()));
        placeholder.armed = false;
        drop(guard);
        debug!("opened cached resource");
        Ok(resource)
      }
      Err(err) => {
        let err = Arc::new(err);
        slot.complete(&mut guard, Err(err.clone()));
        // Waiters wake up with the error before the placeholder goes away.
        drop(guard);
        self.metrics.error();
        debug!(error = %err, "opening cached resource failed");
        drop(placeholder);
        Err(err)
      }
    }
  }

  /// Drops one reference to `key`. When the last reference goes, the
  /// resource moves to the idle tier, possibly closing the least recently
  /// released idle resource to make room.
  ///
  /// Releasing a key that is not active, or whose construction has not
  /// succeeded, is logged and ignored.
  pub fn release(&self, key: &K) {
    let evicted = {
      let mut tiers = self.tiers.lock();
      let in_idle = tiers.idle.contains(key);

      let Some(active) = tiers.active.get_mut(key) else {
        if in_idle {
          warn!("release of an idle resource ignored");
        } else {
          warn!("release of a resource that is not cached ignored");
        }
        return;
      };
      if !active.slot.is_ready() {
        warn!("release of a resource that is not constructed ignored");
        return;
      }

      active.ref_count = match active.ref_count.checked_sub(1) {
        Some(count) => count,
        None => {
          error!("active resource had no references; clamping to zero");
          0
        }
      };
      if active.ref_count > 0 {
        return;
      }

      let Some(entry) = tiers.active.remove(key) else {
        return;
      };
      tiers.idle.push_front(key.clone(), entry.slot);
      trace!(idle = tiers.idle.len(), "resource moved to idle tier");

      if tiers.idle.len() > self.capacity {
        tiers.idle.pop_back().filter(|(victim, slot)| {
          // Only close what is not back in use.
          !tiers
            .active
            .get(victim)
            .is_some_and(|active| Arc::ptr_eq(&active.slot, slot))
        })
      } else {
        None
      }
    };

    self.close_evicted(evicted.map(|(_, slot)| slot).into_iter().collect());
  }

  /// Closes every active and idle resource and empties the cache.
  ///
  /// Meant for shutdown: outstanding references become dangling, and later
  /// `release` calls for them are ignored.
  pub fn purge(&self) {
    let slots: Vec<Arc<ResourceSlot<R>>> = {
      let mut tiers = self.tiers.lock();
      let mut slots: Vec<_> = tiers.active.drain().map(|(_, entry)| entry.slot).collect();
      slots.extend(tiers.idle.drain().into_iter().map(|(_, slot)| slot));
      slots
    };
    self.metrics.removed(slots.len() as u64);
    if !slots.is_empty() {
      debug!(count = slots.len(), "purging cached resources");
    }
    for slot in slots {
      slot.close();
    }
  }

  /// The total number of active and idle resources.
  pub fn len(&self) -> usize {
    let tiers = self.tiers.lock();
    tiers.active.len() + tiers.idle.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn active_len(&self) -> usize {
    self.tiers.lock().active.len()
  }

  pub fn idle_len(&self) -> usize {
    self.tiers.lock().idle.len()
  }

  pub fn is_active(&self, key: &K) -> bool {
    self.tiers.lock().active.contains_key(key)
  }

  pub fn is_idle(&self, key: &K) -> bool {
    self.tiers.lock().idle.contains(key)
  }

  /// The number of outstanding references to an active key.
  pub fn ref_count(&self, key: &K) -> Option<usize> {
    self
      .tiers
      .lock()
      .active
      .get(key)
      .map(|active| active.ref_count)
  }

  /// Idle keys ordered from least to most recently released.
  pub fn idle_keys(&self) -> Vec<K> {
    self.tiers.lock().idle.keys()
  }

  /// The limit on idle resources, which active ones also count against
  /// when a new resource is opened.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}

impl<K, R, H> Drop for RefCache<K, R, H>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher,
{
  fn drop(&mut self) {
    let tiers = self.tiers.get_mut();
    let mut slots: Vec<_> = tiers.active.drain().map(|(_, entry)| entry.slot).collect();
    slots.extend(tiers.idle.drain().into_iter().map(|(_, slot)| slot));
    for slot in slots {
      slot.close();
    }
  }
}

impl<K, R, H> fmt::Debug for RefCache<K, R, H>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RefCache")
      .field("capacity", &self.capacity)
      .field("metrics", &self.metrics.snapshot())
      .finish_non_exhaustive()
  }
}

/// Removes a placeholder from the active tier unless disarmed, including when
/// the constructor panics.
struct Placeholder<'a, K, R, H>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher,
{
  cache: &'a RefCache<K, R, H>,
  key: &'a K,
  slot: &'a Arc<ResourceSlot<R>>,
  armed: bool,
}

impl<K, R, H> Drop for Placeholder<'_, K, R, H>
where
  K: Eq + Hash + Clone,
  R: Resource,
  H: BuildHasher,
{
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let mut tiers = self.cache.tiers.lock();
    // Purge may already have taken it.
    let ours = tiers
      .active
      .get(self.key)
      .is_some_and(|active| Arc::ptr_eq(&active.slot, self.slot));
    if ours {
      tiers.active.remove(self.key);
      self.cache.metrics.removed(1);
    }
  }
}
