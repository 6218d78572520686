use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::ConfigError;

/// How the samples inside the aggregation window are folded into a single load figure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    /// The worst observed value.
    #[default]
    Max,
    /// The arithmetic mean.
    Mean,
    /// The 95th percentile, nearest rank.
    P95,
}

impl Aggregation {
    /// Fold `values` into one load figure, or `None` if there are no values.
    pub fn aggregate(&self, values: impl Iterator<Item = f64>) -> Option<f64> {
        match self {
            Aggregation::Max => values.reduce(f64::max),
            Aggregation::Mean => {
                let (count, sum) = values.fold((0usize, 0.0), |(n, s), v| (n + 1, s + v));
                (count > 0).then(|| sum / count as f64)
            }
            Aggregation::P95 => {
                let mut sorted: Vec<f64> = values.collect();
                if sorted.is_empty() {
                    return None;
                }
                sorted.sort_by(f64::total_cmp);
                let rank = (0.95 * sorted.len() as f64).ceil() as usize;
                Some(sorted[rank.saturating_sub(1)])
            }
        }
    }
}

/// What `SetMaxRate` does with a shard the throttler has never seen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownShardPolicy {
    /// Register the shard at the initial rate and apply the request.
    #[default]
    AutoRegister,
    /// Fail the request with [`crate::ThrottlerError::UnknownShard`].
    Reject,
}

/// Tunables for the control loop and its surrounding state.
///
/// Every field has a default, so a partial document is enough:
///
/// ```rust
/// use shard_limit::ThrottlerConfig;
///
/// let config = ThrottlerConfig::from_json(r#"{ "target": 250.0, "aggregation": "p95" }"#).unwrap();
/// assert_eq!(config.target, 250.0);
/// assert_eq!(config.max_rate, ThrottlerConfig::default().max_rate);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThrottlerConfig {
    /// Rate reported for shards with no rate state. Unknown shards fail open.
    pub default_rate: f64,
    /// Rate a shard starts from when it is registered.
    pub initial_rate: f64,
    /// Floor: the computed rate never drops below this value.
    pub min_rate: f64,
    /// Ceiling: the computed rate never exceeds this value.
    pub max_rate: f64,
    /// Load (or lag) level the control loop steers towards.
    pub target: f64,
    /// Fraction below `target` the load must fall before the rate is raised.
    pub margin: f64,
    /// Additive increase applied per tick while under target.
    pub increase_step: f64,
    /// Smallest decrease applied per tick while over target.
    pub decrease_step: f64,
    /// Fraction of the current rate kept on a multiplicative decrease.
    pub backoff_ratio: f64,
    /// Largest change allowed in a single tick.
    pub max_delta: f64,
    /// How long samples are kept.
    pub retention_ms: u64,
    /// How far back a recompute looks.
    pub aggregation_window_ms: u64,
    /// How far behind the newest sample a late sample may arrive and still be kept.
    pub skew_tolerance_ms: u64,
    /// Upper bound on retained samples per shard.
    pub max_samples_per_shard: usize,
    /// Recompute period.
    pub tick_interval_ms: u64,
    /// Time a single tick may spend recomputing before it yields.
    pub tick_budget_ms: u64,
    pub aggregation: Aggregation,
    pub unknown_shard_policy: UnknownShardPolicy,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            default_rate: 10_000.0,
            initial_rate: 1_000.0,
            min_rate: 0.0,
            max_rate: 10_000.0,
            target: 100.0,
            margin: 0.1,
            increase_step: 10.0,
            decrease_step: 50.0,
            backoff_ratio: 0.5,
            max_delta: 1_000.0,
            retention_ms: 60_000,
            aggregation_window_ms: 5_000,
            skew_tolerance_ms: 1_000,
            max_samples_per_shard: 1_024,
            tick_interval_ms: 1_000,
            tick_budget_ms: 100,
            aggregation: Aggregation::Max,
            unknown_shard_policy: UnknownShardPolicy::AutoRegister,
        }
    }
}

impl ThrottlerConfig {
    /// Parse a JSON document and validate the result.
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn aggregation_window(&self) -> Duration {
        Duration::from_millis(self.aggregation_window_ms)
    }

    pub fn skew_tolerance(&self) -> Duration {
        Duration::from_millis(self.skew_tolerance_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn tick_budget(&self) -> Duration {
        Duration::from_millis(self.tick_budget_ms)
    }

    /// Check the invariants the control loop relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = [
            ("default-rate", self.default_rate),
            ("initial-rate", self.initial_rate),
            ("min-rate", self.min_rate),
            ("max-rate", self.max_rate),
            ("increase-step", self.increase_step),
            ("decrease-step", self.decrease_step),
            ("max-delta", self.max_delta),
        ];
        for (field, value) in rates {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(field, "must be finite and non-negative"));
            }
        }
        if self.min_rate > self.max_rate {
            return Err(ConfigError::invalid("min-rate", "must not exceed max-rate"));
        }
        if !(self.min_rate..=self.max_rate).contains(&self.initial_rate) {
            return Err(ConfigError::invalid(
                "initial-rate",
                "must lie between min-rate and max-rate",
            ));
        }
        if !self.target.is_finite() || self.target <= 0.0 {
            return Err(ConfigError::invalid("target", "must be finite and positive"));
        }
        if !(0.0..1.0).contains(&self.margin) {
            return Err(ConfigError::invalid("margin", "must lie in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.backoff_ratio) {
            return Err(ConfigError::invalid("backoff-ratio", "must lie in [0, 1]"));
        }
        if self.max_delta < self.decrease_step {
            return Err(ConfigError::invalid(
                "max-delta",
                "must be at least decrease-step",
            ));
        }
        if self.aggregation_window_ms == 0 {
            return Err(ConfigError::invalid("aggregation-window-ms", "must be non-zero"));
        }
        if self.aggregation_window_ms > self.retention_ms {
            return Err(ConfigError::invalid(
                "aggregation-window-ms",
                "must not exceed retention-ms",
            ));
        }
        if self.max_samples_per_shard == 0 {
            return Err(ConfigError::invalid("max-samples-per-shard", "must be non-zero"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick-interval-ms", "must be non-zero"));
        }
        Ok(())
    }
}
