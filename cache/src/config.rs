use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::mode::ConstructionMode;

/// Declarative settings for any of the caches, typically read from a
/// configuration file.
///
/// Every field is optional when deserializing. `max_age` accepts humantime
/// strings such as `"90s"` or `"1h 30m"`, and `mode` is lowercase:
///
/// ```json
/// { "max_items": 1000, "mode": "decoupled", "max_age": "5m" }
/// ```
///
/// Pass it to a builder with `config(&cfg)`. Fields that do not apply to a
/// cache kind (e.g. `mode` for a `RefCache`) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
  pub max_items: usize,
  pub mode: ConstructionMode,
  #[cfg_attr(feature = "serde", serde(with = "crate::time::humantime_opt"))]
  pub max_age: Option<Duration>,
  pub reset_age_on_access: bool,
  pub reset_age_after_creation: bool,
  pub serve_stale_during_refresh: bool,
}
