use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// An expiring cache was configured without a max age.
  #[error("an expiring cache requires a max age")]
  MissingMaxAge,
  /// An expiring cache was configured with a zero max age, which would make
  /// every entry stale on arrival.
  #[error("max age must be greater than zero, got {0:?}")]
  ZeroMaxAge(Duration),
}

/// Returned when a string does not name a construction mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown construction mode {0:?}, expected one of: blocking, concurrent, decoupled")]
pub struct ParseModeError(pub String);
