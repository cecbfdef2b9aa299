//! Concurrent, bounded caches for values that are expensive to build.
//!
//! # Features
//! - **Bounded LRU**: [`Cache`] holds at most `capacity` entries and evicts the
//!   least recently used one on overflow.
//! - **Construction Modes**: [`ConstructionMode`] picks how concurrent misses
//!   on a key are filled: under the cache lock, independently, or once per key
//!   through per-key locks that leave other keys unaffected.
//! - **Expiration**: [`ExpiringCache`] rebuilds entries once they reach a max
//!   age, with optional sliding expiration and stale-serving during refresh.
//! - **Resource Lifecycles**: [`RefCache`] reference-counts resources that must
//!   be closed, keeping recently released ones open in an idle LRU tier.
//! - **Non-Clone Support**: Values are handed out as `Arc<V>`, avoiding
//!   `V: Clone` bounds.
//! - **Observability**: Every cache exposes a [`MetricsSnapshot`] and logs
//!   through `tracing`.

// Public modules that form the API
pub mod builder;
pub mod config;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod mode;
pub mod time;

// Internal, crate-only modules
mod cache;
mod entry;
mod expiring;
mod lru_list;
mod named_lock;
mod ref_cache;

// Re-export the primary user-facing types for convenience
pub use builder::{CacheBuilder, ExpiringCacheBuilder, RefCacheBuilder};
pub use cache::Cache;
pub use config::CacheConfig;
pub use error::{BuildError, ParseModeError};
pub use expiring::ExpiringCache;
pub use listener::{EvictionListener, EvictionReason};
pub use metrics::{MetricValue, MetricsConfig, MetricsSnapshot};
pub use mode::ConstructionMode;
pub use ref_cache::{RefCache, Resource};
pub use time::{Clock, ManualClock, SystemClock};
