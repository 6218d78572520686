use std::sync::Arc;

use dashmap::DashMap;
use quanta::Clock;
use quanta::Instant;

use crate::SampleStore;
use crate::ThrottlerConfig;

/// The computed rate of a registered shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateState {
    pub current_max_rate: f64,
    /// When the rate last changed, `None` if it never has.
    pub last_adjustment: Option<Instant>,
}

impl RateState {
    fn new(rate: f64) -> Self {
        Self {
            current_max_rate: rate,
            last_adjustment: None,
        }
    }
}

/// Outcome of a single recompute tick for one shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    Increased { from: f64, to: f64, load: f64 },
    Decreased { from: f64, to: f64, load: f64 },
    /// Load is inside the target band, or the rate is already at its bound.
    Held { rate: f64, load: f64 },
    /// No samples inside the aggregation window; the rate is left alone.
    Skipped,
}

impl Adjustment {
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            Adjustment::Increased { .. } | Adjustment::Decreased { .. }
        )
    }
}

/// Additive-increase / multiplicative-decrease controller over the sample store.
#[derive(Debug)]
pub struct RateLimiter {
    store: Arc<SampleStore>,
    states: DashMap<String, RateState>,
    config: ThrottlerConfig,
    clock: Clock,
}

impl RateLimiter {
    pub fn new(store: Arc<SampleStore>, config: ThrottlerConfig) -> Self {
        Self::with_clock(store, config, Clock::new())
    }

    pub fn with_clock(store: Arc<SampleStore>, config: ThrottlerConfig, clock: Clock) -> Self {
        Self {
            store,
            states: DashMap::new(),
            config,
            clock,
        }
    }

    /// Run one control step for `shard`.
    ///
    /// The sample window is read and the new rate written while the shard's
    /// sample lock is held, so a concurrent `record` never tears the window.
    pub fn recompute(&self, shard: &str) -> Adjustment {
        self.store
            .with_recent_samples(shard, self.config.aggregation_window(), |samples| {
                let Some(load) = self.config.aggregation.aggregate(samples.values()) else {
                    return Adjustment::Skipped;
                };

                let mut state = self
                    .states
                    .entry(shard.to_owned())
                    .or_insert_with(|| RateState::new(self.config.initial_rate));

                let from = state.current_max_rate;
                let to = self.next_rate(from, load);
                if to == from {
                    return Adjustment::Held { rate: from, load };
                }

                state.current_max_rate = to;
                state.last_adjustment = Some(self.clock.now());
                if to > from {
                    Adjustment::Increased { from, to, load }
                } else {
                    Adjustment::Decreased { from, to, load }
                }
            })
    }

    fn next_rate(&self, current: f64, load: f64) -> f64 {
        let c = &self.config;
        if load > c.target {
            // Back off faster than we recover
            let multiplicative = current * (1.0 - c.backoff_ratio);
            let delta = multiplicative.max(c.decrease_step).min(c.max_delta);
            (current - delta).max(c.min_rate)
        } else if load < c.target * (1.0 - c.margin) {
            let delta = c.increase_step.min(c.max_delta);
            (current + delta).min(c.max_rate)
        } else {
            current
        }
    }

    /// The computed rate for `shard`, or the configured default if it is unknown.
    pub fn current_rate(&self, shard: &str) -> f64 {
        self.states
            .get(shard)
            .map(|state| state.current_max_rate)
            .unwrap_or(self.config.default_rate)
    }

    pub fn state(&self, shard: &str) -> Option<RateState> {
        self.states.get(shard).map(|state| *state)
    }

    /// Start tracking `shard` at the initial rate. Returns `false` if it was already registered.
    pub fn register(&self, shard: &str) -> bool {
        if self.states.contains_key(shard) {
            return false;
        }
        let mut inserted = false;
        self.states.entry(shard.to_owned()).or_insert_with(|| {
            inserted = true;
            RateState::new(self.config.initial_rate)
        });
        inserted
    }

    pub fn deregister(&self, shard: &str) -> Option<RateState> {
        self.states.remove(shard).map(|(_, state)| state)
    }

    pub fn is_registered(&self, shard: &str) -> bool {
        self.states.contains_key(shard)
    }

    /// Registered shards, sorted.
    pub fn shards(&self) -> Vec<String> {
        let mut shards: Vec<String> = self.states.iter().map(|e| e.key().clone()).collect();
        shards.sort_unstable();
        shards
    }
}
