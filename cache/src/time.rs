use once_cell::sync::Lazy;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// The single, static reference point for all system clock readings.
// It is initialized lazily on its first use.
static CACHE_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Converts an `Instant` into a `Duration` since the cache's epoch.
#[inline]
pub(crate) fn instant_to_duration(instant: Instant) -> Duration {
  instant.saturating_duration_since(*CACHE_EPOCH)
}

#[inline]
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// A monotonic time source for expiration decisions.
///
/// Readings are expressed as a `Duration` since an arbitrary, fixed epoch;
/// only differences between readings are meaningful.
pub trait Clock: Send + Sync {
  fn now(&self) -> Duration;
}

/// The default clock, backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  #[inline]
  fn now(&self) -> Duration {
    instant_to_duration(Instant::now())
  }
}

/// A clock that only moves when told to.
///
/// Useful for exercising expiration deterministically.
#[derive(Default)]
pub struct ManualClock {
  nanos: AtomicU64,
}

impl ManualClock {
  /// Creates a clock reading zero.
  pub fn new() -> Self {
    Self::default()
  }

  /// Moves the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    self.nanos.fetch_add(duration_to_nanos(by), Ordering::SeqCst);
  }

  /// Sets the clock to an absolute reading. Moving backwards is allowed.
  pub fn set(&self, at: Duration) {
    self.nanos.store(duration_to_nanos(at), Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Duration {
    Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
  }
}

impl fmt::Debug for ManualClock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ManualClock").field("now", &self.now()).finish()
  }
}

/// Serde helpers for `Option<Duration>` written as humantime strings ("5s", "1h 30m").
#[cfg(feature = "serde")]
pub(crate) mod humantime_opt {
  use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    raw
      .map(|text| humantime::parse_duration(&text).map_err(D::Error::custom))
      .transpose()
  }
}
