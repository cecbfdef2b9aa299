use std::fmt;
use std::sync::Arc;

/// Describes the reason an entry was removed from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
  /// The entry was the least recently used one when an insertion exceeded capacity.
  Capacity,
  /// The entry's max age elapsed and it was swept.
  Expired,
  /// The entry was removed explicitly, or the cache was purged.
  Invalidated,
}

impl fmt::Display for EvictionReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EvictionReason::Capacity => write!(f, "evicted due to capacity"),
      EvictionReason::Expired => write!(f, "evicted due to expiration"),
      EvictionReason::Invalidated => write!(f, "manually invalidated"),
    }
  }
}

/// A listener that can be registered with the cache to receive notifications
/// when entries leave it.
///
/// `on_evict` is always called after the cache-wide lock has been released,
/// so it may call back into the cache.
pub trait EvictionListener<K, V>: Send + Sync {
  fn on_evict(&self, key: K, value: Arc<V>, reason: EvictionReason);
}

impl<K, V, F> EvictionListener<K, V> for F
where
  F: Fn(K, Arc<V>, EvictionReason) + Send + Sync,
{
  fn on_evict(&self, key: K, value: Arc<V>, reason: EvictionReason) {
    self(key, value, reason)
  }
}
