use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mode::ConstructionMode;

/// Static configuration reported alongside the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricsConfig {
  /// The configured capacity (the idle-tier capacity for a `RefCache`).
  pub max_items: usize,
  /// The max age of an expiring cache, `None` for caches without one.
  #[cfg_attr(feature = "serde", serde(with = "crate::time::humantime_opt"))]
  pub max_age: Option<Duration>,
  /// The construction mode, `None` for a `RefCache`, which always
  /// single-flights per entry.
  pub mode: Option<ConstructionMode>,
}

/// A thread-safe, internal metrics collector for a cache.
/// All counters are atomic to allow for lock-free updates.
#[derive(Debug)]
pub(crate) struct Metrics {
  hits: CachePadded<AtomicU64>,
  stale_hits: CachePadded<AtomicU64>,
  misses: CachePadded<AtomicU64>,
  errors: CachePadded<AtomicU64>,
  added: CachePadded<AtomicU64>,
  removed: CachePadded<AtomicU64>,
  config: MetricsConfig,
}

impl Metrics {
  pub(crate) fn new(config: MetricsConfig) -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      stale_hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      errors: CachePadded::new(AtomicU64::new(0)),
      added: CachePadded::new(AtomicU64::new(0)),
      removed: CachePadded::new(AtomicU64::new(0)),
      config,
    }
  }

  #[inline]
  pub(crate) fn hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn stale_hit(&self) {
    self.stale_hits.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn error(&self) {
    self.errors.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn added(&self, count: u64) {
    self.added.fetch_add(count, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn removed(&self, count: u64) {
    self.removed.fetch_add(count, Ordering::Relaxed);
  }

  /// Reclassifies a previously recorded miss as a hit. Used when a caller
  /// that missed finds the value after waiting for another caller's
  /// construction.
  pub(crate) fn miss_to_hit(&self) {
    // The miss was recorded by this same caller, so the counter cannot be zero.
    self.misses.fetch_sub(1, Ordering::Relaxed);
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      hits: self.hits.load(Ordering::Relaxed),
      stale_hits: self.stale_hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      errors: self.errors.load(Ordering::Relaxed),
      added: self.added.load(Ordering::Relaxed),
      removed: self.removed.load(Ordering::Relaxed),
      config: self.config,
    }
  }
}

/// A point-in-time, public-facing snapshot of a cache's metrics.
///
/// With the `serde` feature it serializes as
/// `{hits, stale_hits, misses, errors, added, removed, config: {max_items, max_age, mode}}`.
#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetricsSnapshot {
  /// Lookups answered from the cache.
  pub hits: u64,
  /// Expired values served while a refresh was in flight.
  pub stale_hits: u64,
  /// Lookups that found nothing usable.
  pub misses: u64,
  /// Failed constructions.
  pub errors: u64,
  /// Entries inserted.
  pub added: u64,
  /// Entries that left the cache for any reason.
  pub removed: u64,
  pub config: MetricsConfig,
}

impl MetricsSnapshot {
  /// The number of entries the counters account for (`added - removed`).
  pub fn current_items(&self) -> u64 {
    self.added.saturating_sub(self.removed)
  }

  /// The fraction of lookups served from the cache, stale hits included.
  pub fn hit_ratio(&self) -> f64 {
    let served = self.hits + self.stale_hits;
    let total = served + self.misses;
    if total == 0 {
      0.0
    } else {
      served as f64 / total as f64
    }
  }

  /// Exports the snapshot as a generic key/value structure for telemetry
  /// backends that do not speak serde.
  pub fn to_map(&self) -> BTreeMap<String, MetricValue> {
    let mut config = BTreeMap::new();
    config.insert(
      "max_items".to_string(),
      MetricValue::Count(self.config.max_items as u64),
    );
    config.insert(
      "max_age".to_string(),
      self
        .config
        .max_age
        .map_or(MetricValue::Empty, MetricValue::Duration),
    );
    config.insert(
      "mode".to_string(),
      self
        .config
        .mode
        .map_or(MetricValue::Empty, |mode| MetricValue::Text(mode.to_string())),
    );

    let mut map = BTreeMap::new();
    map.insert("hits".to_string(), MetricValue::Count(self.hits));
    map.insert("stale_hits".to_string(), MetricValue::Count(self.stale_hits));
    map.insert("misses".to_string(), MetricValue::Count(self.misses));
    map.insert("errors".to_string(), MetricValue::Count(self.errors));
    map.insert("added".to_string(), MetricValue::Count(self.added));
    map.insert("removed".to_string(), MetricValue::Count(self.removed));
    map.insert("config".to_string(), MetricValue::Map(config));
    map
  }
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("stale_hits", &self.stale_hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio() * 100.0))
      .field("errors", &self.errors)
      .field("added", &self.added)
      .field("removed", &self.removed)
      .field("config", &self.config)
      .finish()
  }
}

/// A value in the map produced by [`MetricsSnapshot::to_map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
  Count(u64),
  Duration(Duration),
  Text(String),
  Map(BTreeMap<String, MetricValue>),
  /// The setting does not apply to this cache.
  Empty,
}
