//! # shard-limit
//!
//! `shard-limit` computes an advisory maximum request rate for each shard of a fleet
//! (database replicas, partitions, backends) from the load or lag signals those
//! shards report.
//!
//! ## Core Philosophy
//!
//! The throttler is guidance, not an admission gate. Every read is fail-open: a shard
//! that has never reported a signal is given the configured default rate rather than an
//! error, and a shard whose signals dry up keeps its last rate rather than drifting.
//!
//! ## Key Concepts
//!
//! * **Per-Shard Locking**: Samples for each shard sit behind their own lock, created on
//!   first use. Recording and recomputing the same shard are serialised; different shards
//!   never contend.
//! * **AIMD Control Loop**: [`RateLimiter::recompute`] raises a shard's rate additively
//!   while its load sits comfortably under target and cuts it multiplicatively as soon as
//!   the target is exceeded.
//! * **Overrides**: An operator can pin a shard's rate, optionally with a ttl. The control
//!   loop keeps running underneath so clearing an override hands back a current value.
//!
//! ## Example
//!
//! ```rust
//! use shard_limit::Throttler;
//! use shard_limit::ThrottlerConfig;
//!
//! let config = ThrottlerConfig::default();
//! let throttler = Throttler::new(config.clone()).unwrap();
//!
//! let _ = throttler.record_now("replica-1", 12.0);
//! let _ = throttler.recompute("replica-1");
//! throttler.set_max_rate("replica-2", 50.0, None).unwrap();
//!
//! let rates = throttler.max_rates(["replica-1", "replica-2", "replica-3"]);
//! assert!(rates["replica-1"] > config.initial_rate);
//! assert_eq!(rates["replica-2"], 50.0);
//! assert_eq!(rates["replica-3"], config.default_rate);
//! ```

mod config;
mod error;
mod limiter;
mod overrides;
mod store;
mod throttler;

pub use config::Aggregation;
pub use config::ThrottlerConfig;
pub use config::UnknownShardPolicy;
pub use error::ConfigError;
pub use error::ThrottlerError;
pub use limiter::Adjustment;
pub use limiter::RateLimiter;
pub use limiter::RateState;
pub use overrides::Override;
pub use overrides::OverrideRegistry;
pub use overrides::OverrideSnapshot;
pub use store::Dropped;
pub use store::RecentSamples;
pub use store::Sample;
pub use store::SampleStore;
pub use throttler::Throttler;

pub use quanta::Clock;
pub use quanta::Instant;
