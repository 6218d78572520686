use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use crate::Adjustment;
use crate::ConfigError;
use crate::Dropped;
use crate::OverrideRegistry;
use crate::RateLimiter;
use crate::SampleStore;
use crate::ThrottlerConfig;
use crate::ThrottlerError;
use crate::UnknownShardPolicy;

/// The throttler context: sample store, rate limiter core and override registry.
///
/// There is no process-wide instance. Construct one, share it behind an
/// `Arc`, and drive it from the sample feed, the recompute loop and the RPC
/// handlers concurrently.
#[derive(Debug)]
pub struct Throttler {
    config: ThrottlerConfig,
    clock: Clock,
    store: Arc<SampleStore>,
    limiter: RateLimiter,
    overrides: OverrideRegistry,
    dropped: AtomicU64,
}

impl Throttler {
    pub fn new(config: ThrottlerConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: ThrottlerConfig, clock: Clock) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_samples_per_shard)
            .ok_or_else(|| ConfigError::invalid("max-samples-per-shard", "must be non-zero"))?;

        let store = Arc::new(SampleStore::with_clock(
            config.retention(),
            config.skew_tolerance(),
            capacity,
            clock.clone(),
        ));
        let limiter = RateLimiter::with_clock(Arc::clone(&store), config.clone(), clock.clone());
        let overrides = OverrideRegistry::with_clock(clock.clone());

        Ok(Self {
            config,
            clock,
            store,
            limiter,
            overrides,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ThrottlerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn overrides(&self) -> &OverrideRegistry {
        &self.overrides
    }

    /// Samples discarded since construction.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Record a load sample. An accepted sample registers its shard.
    pub fn record(&self, shard: &str, value: f64, timestamp: Instant) -> ControlFlow<Dropped> {
        let outcome = self.store.record(shard, value, timestamp);
        match outcome {
            ControlFlow::Continue(()) => {
                self.limiter.register(shard);
            }
            ControlFlow::Break(reason) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(shard, value, reason = reason.as_str(), "dropped sample");
            }
        }
        outcome
    }

    pub fn record_now(&self, shard: &str, value: f64) -> ControlFlow<Dropped> {
        self.record(shard, value, self.clock.now())
    }

    /// Run one control step for `shard`.
    pub fn recompute(&self, shard: &str) -> Adjustment {
        let adjustment = self.limiter.recompute(shard);
        match adjustment {
            Adjustment::Increased { from, to, load } | Adjustment::Decreased { from, to, load } => {
                tracing::trace!(shard, from, to, load, "adjusted max rate");
            }
            Adjustment::Skipped => tracing::debug!(shard, "no recent samples; holding rate"),
            Adjustment::Held { .. } => {}
        }
        adjustment
    }

    /// Every shard the recompute loop should visit, sorted.
    pub fn shards(&self) -> Vec<String> {
        let mut shards = self.limiter.shards();
        shards.extend(self.store.shards());
        shards.sort_unstable();
        shards.dedup();
        shards
    }

    pub fn register(&self, shard: &str) -> bool {
        self.limiter.register(shard)
    }

    /// Forget everything about `shard`: samples, computed rate and override.
    pub fn deregister(&self, shard: &str) -> bool {
        let state = self.limiter.deregister(shard).is_some();
        let samples = self.store.remove(shard);
        let pinned = self.overrides.clear_override(shard).is_some();
        state || samples || pinned
    }

    pub fn is_registered(&self, shard: &str) -> bool {
        self.limiter.is_registered(shard)
    }

    /// The rate callers should honour: the override if one is active, otherwise the computed rate.
    pub fn current_rate(&self, shard: &str) -> f64 {
        self.overrides
            .effective_rate(shard, self.limiter.current_rate(shard))
    }

    /// Effective rates for the requested shards. Unknown shards get the default rate.
    pub fn max_rates<I, S>(&self, shards: I) -> HashMap<String, f64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        shards
            .into_iter()
            .map(|shard| {
                let shard = shard.as_ref();
                (shard.to_owned(), self.current_rate(shard))
            })
            .collect()
    }

    /// Effective rates for every registered or overridden shard.
    pub fn all_max_rates(&self) -> HashMap<String, f64> {
        let mut shards = self.limiter.shards();
        shards.extend(self.overrides.shards());
        self.max_rates(shards)
    }

    fn admit(&self, shard: &str) -> Result<(), ThrottlerError> {
        match self.config.unknown_shard_policy {
            UnknownShardPolicy::AutoRegister => {
                if self.limiter.register(shard) {
                    tracing::info!(shard, "registered shard");
                }
                Ok(())
            }
            UnknownShardPolicy::Reject if self.limiter.is_registered(shard) => Ok(()),
            UnknownShardPolicy::Reject => Err(ThrottlerError::UnknownShard {
                shard: shard.to_owned(),
            }),
        }
    }

    /// Pin `shard` to `rate`, optionally for `ttl`.
    pub fn set_max_rate(
        &self,
        shard: &str,
        rate: f64,
        ttl: Option<Duration>,
    ) -> Result<(), ThrottlerError> {
        OverrideRegistry::validate(shard, rate, ttl)?;
        self.admit(shard)?;
        let previous = self.overrides.set_override(shard, rate, ttl)?;
        tracing::info!(
            shard,
            rate,
            ?ttl,
            previous = ?previous.map(|p| p.pinned_rate),
            "max rate override set"
        );
        Ok(())
    }

    /// Remove the override for `shard`, handing control back to the computed rate.
    ///
    /// Returns whether an override was active.
    pub fn clear_max_rate(&self, shard: &str) -> Result<bool, ThrottlerError> {
        if shard.is_empty() {
            return Err(ThrottlerError::EmptyShardId);
        }
        if self.config.unknown_shard_policy == UnknownShardPolicy::Reject
            && !self.limiter.is_registered(shard)
        {
            return Err(ThrottlerError::UnknownShard {
                shard: shard.to_owned(),
            });
        }

        let cleared = self.overrides.clear_override(shard);
        if let Some(previous) = cleared {
            tracing::info!(shard, previous = previous.pinned_rate, "max rate override cleared");
        }
        Ok(cleared.is_some())
    }

    /// Pin every registered shard to `rate`. Returns the shards that were updated.
    pub fn set_max_rate_all(
        &self,
        rate: f64,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, ThrottlerError> {
        OverrideRegistry::validate("*", rate, ttl)?;
        let shards = self.limiter.shards();
        for shard in &shards {
            self.overrides.set_override(shard, rate, ttl)?;
        }
        tracing::info!(rate, ?ttl, shards = shards.len(), "max rate override set on all shards");
        Ok(shards)
    }
}
