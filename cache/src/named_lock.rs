use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// A registry of per-key mutexes, created on demand.
///
/// Locking one key never blocks callers locking a different key. Each lock
/// carries a small state slot `S` that lives as long as someone holds or
/// waits for the lock; once the last user lets go, the entry is removed and
/// the next caller starts from `S::default()`.
///
/// Each key also has an epoch that holders advance. A guard remembers the
/// epoch seen when its caller joined the queue, so state written by a holder
/// can be scoped to the callers that were already waiting.
pub(crate) struct NamedLocks<K, S = ()>
where
  K: Eq + Hash,
{
  locks: DashMap<K, KeyLock<S>, ahash::RandomState>,
}

struct KeyLock<S> {
  epoch: Arc<AtomicU64>,
  state: Arc<Mutex<S>>,
}

impl<S: Default> KeyLock<S> {
  fn new() -> Self {
    Self {
      epoch: Arc::new(AtomicU64::new(0)),
      state: Arc::new(Mutex::new(S::default())),
    }
  }
}

impl<K, S> NamedLocks<K, S>
where
  K: Eq + Hash + Clone,
  S: Default,
{
  pub(crate) fn new() -> Self {
    Self {
      locks: DashMap::with_hasher(ahash::RandomState::new()),
    }
  }

  /// Blocks until the lock for `key` is held by the caller.
  pub(crate) fn lock(&self, key: &K) -> NamedLockGuard<'_, K, S> {
    let (state, epoch) = {
      let entry = self
        .locks
        .entry(key.clone())
        .or_insert_with(KeyLock::new);
      (Arc::clone(&entry.state), Arc::clone(&entry.epoch))
    };
    let joined_epoch = epoch.load(Ordering::Acquire);
    // The map shard is released by now; only the key's own lock can block.
    let guard = state.lock_arc();
    NamedLockGuard {
      registry: self,
      key: key.clone(),
      epoch,
      joined_epoch,
      guard: Some(guard),
    }
  }

  /// The number of keys currently locked or waited on.
  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.locks.len()
  }

  /// How many callers currently hold or wait for `key`.
  #[cfg(test)]
  pub(crate) fn users(&self, key: &K) -> usize {
    self
      .locks
      .get(key)
      .map_or(0, |lock| Arc::strong_count(&lock.state) - 1)
  }
}

impl<K: Eq + Hash, S> fmt::Debug for NamedLocks<K, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NamedLocks")
      .field("keys", &self.locks.len())
      .finish()
  }
}

/// Holds the lock for one key. Dropping it unlocks the key and removes the
/// registry entry if nobody else references it.
pub(crate) struct NamedLockGuard<'a, K, S>
where
  K: Eq + Hash,
{
  registry: &'a NamedLocks<K, S>,
  key: K,
  epoch: Arc<AtomicU64>,
  joined_epoch: u64,
  guard: Option<ArcMutexGuard<RawMutex, S>>,
}

impl<K: Eq + Hash, S> NamedLockGuard<'_, K, S> {
  /// The key's epoch when this caller started waiting for the lock.
  pub(crate) fn joined_epoch(&self) -> u64 {
    self.joined_epoch
  }

  /// Advances the key's epoch and returns the new value. Callers that join
  /// from now on observe it as their `joined_epoch`.
  pub(crate) fn advance_epoch(&self) -> u64 {
    self.epoch.fetch_add(1, Ordering::AcqRel) + 1
  }
}

impl<K: Eq + Hash, S> Deref for NamedLockGuard<'_, K, S> {
  type Target = S;

  fn deref(&self) -> &S {
    self.guard.as_deref().expect("guard is only taken in drop")
  }
}

impl<K: Eq + Hash, S> DerefMut for NamedLockGuard<'_, K, S> {
  fn deref_mut(&mut self) -> &mut S {
    self.guard.as_deref_mut().expect("guard is only taken in drop")
  }
}

impl<K: Eq + Hash, S> Drop for NamedLockGuard<'_, K, S> {
  fn drop(&mut self) {
    // Unlock first so our own Arc no longer counts as a user.
    drop(self.guard.take());
    // Clones are taken under the shard lock, which `remove_if` also holds,
    // so a count of one means nobody can be waiting.
    self
      .registry
      .locks
      .remove_if(&self.key, |_, lock| Arc::strong_count(&lock.state) == 1);
  }
}
