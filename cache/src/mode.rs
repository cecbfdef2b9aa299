use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseModeError;

/// Governs how a cache miss is turned into a value when several callers
/// race on the cache.
///
/// The mode is fixed when the cache is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ConstructionMode {
  /// The cache-wide lock is held while the constructor runs.
  ///
  /// Exactly one construction per missing key, but a slow constructor for
  /// one key stalls every other operation on the cache.
  Blocking,

  /// The cache-wide lock is released before the constructor runs.
  ///
  /// Callers missing on the same key construct independently. The last
  /// insertion wins in the cache, while each caller gets the value it built.
  Concurrent,

  /// The cache-wide lock is released and a per-key lock taken before the
  /// constructor runs.
  ///
  /// One construction per key at a time, without serializing unrelated keys.
  #[default]
  Decoupled,
}

impl ConstructionMode {
  pub const ALL: [ConstructionMode; 3] = [
    ConstructionMode::Blocking,
    ConstructionMode::Concurrent,
    ConstructionMode::Decoupled,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ConstructionMode::Blocking => "blocking",
      ConstructionMode::Concurrent => "concurrent",
      ConstructionMode::Decoupled => "decoupled",
    }
  }
}

impl fmt::Display for ConstructionMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ConstructionMode {
  type Err = ParseModeError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    ConstructionMode::ALL
      .into_iter()
      .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| ParseModeError(s.to_string()))
  }
}
