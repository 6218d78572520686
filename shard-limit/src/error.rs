use std::time::Duration;

/// Errors returned to callers of the throttler's update operations.
///
/// None of these are fatal: they describe a rejected request and leave the
/// throttler's state untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThrottlerError {
    /// The requested rate is negative or not a number.
    #[error("invalid max rate {rate} for shard {shard}: rate must be finite and non-negative")]
    InvalidRate { shard: String, rate: f64 },

    /// An override was requested with a zero time-to-live.
    #[error("invalid ttl {ttl:?} for shard {shard}: ttl must be non-zero")]
    InvalidTtl { shard: String, ttl: Duration },

    /// A request to pin a rate did not carry one.
    #[error("missing max rate for shard {shard}: set a rate or clear the override")]
    MissingRate { shard: String },

    /// The request did not name a shard.
    #[error("shard id must not be empty")]
    EmptyShardId,

    /// The shard is not registered and the deployment rejects unknown shards.
    #[error("unknown shard: {shard}")]
    UnknownShard { shard: String },
}

/// Errors produced while loading a [`crate::ThrottlerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A field holds a value the control loop cannot work with.
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },

    /// The document could not be parsed.
    #[error("failed to parse throttler config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self::Invalid { field, reason }
    }
}
