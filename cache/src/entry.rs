use crate::time::duration_to_nanos;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A value stored by the expiring cache, with the metadata needed to decide
/// its staleness.
#[derive(Debug)]
pub(crate) struct ExpiringEntry<V> {
  /// The user's value, wrapped in an Arc for shared ownership.
  value: Arc<V>,
  /// Clock reading, in nanoseconds, of the last refresh.
  last_updated: AtomicU64,
  /// Set while a replacement for this entry is being constructed.
  refreshing: AtomicBool,
}

impl<V> ExpiringEntry<V> {
  pub(crate) fn new(value: Arc<V>, now: Duration) -> Self {
    Self {
      value,
      last_updated: AtomicU64::new(duration_to_nanos(now)),
      refreshing: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn value(&self) -> Arc<V> {
    self.value.clone()
  }

  #[inline]
  pub(crate) fn value_ref(&self) -> &V {
    &self.value
  }

  #[inline]
  pub(crate) fn last_updated(&self) -> Duration {
    Duration::from_nanos(self.last_updated.load(Ordering::Relaxed))
  }

  /// Restarts the entry's age at `now`.
  #[inline]
  pub(crate) fn touch(&self, now: Duration) {
    self
      .last_updated
      .store(duration_to_nanos(now), Ordering::Relaxed);
  }

  /// An entry is expired once `max_age` has fully elapsed since its last refresh.
  #[inline]
  pub(crate) fn is_expired(&self, now: Duration, max_age: Duration) -> bool {
    now.saturating_sub(self.last_updated()) >= max_age
  }

  #[inline]
  pub(crate) fn is_refreshing(&self) -> bool {
    self.refreshing.load(Ordering::Acquire)
  }

  /// Marks a refresh as in flight until the returned guard is dropped.
  pub(crate) fn begin_refresh(&self) -> RefreshGuard<'_> {
    self.refreshing.store(true, Ordering::Release);
    RefreshGuard {
      flag: &self.refreshing,
    }
  }
}

/// Clears the in-flight marker whether the refresh succeeded, failed or panicked.
pub(crate) struct RefreshGuard<'a> {
  flag: &'a AtomicBool,
}

impl Drop for RefreshGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}
