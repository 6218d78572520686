use std::time::Duration;

use dashmap::DashMap;
use quanta::Clock;
use quanta::Instant;
use serde::Deserialize;
use serde::Serialize;

use crate::ThrottlerError;

/// A manually pinned max rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Override {
    pub pinned_rate: f64,
    /// `None` pins the rate until it is explicitly cleared.
    pub expires_at: Option<Instant>,
}

impl Override {
    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    /// Time left before expiry, `None` for overrides without a ttl.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Serialisable form of an active override, used to carry overrides across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideSnapshot {
    pub shard: String,
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

/// Pinned rates keyed by shard. At most one override exists per shard.
///
/// Expiry is evaluated lazily when an override is read; [`OverrideRegistry::purge_expired`]
/// can be called periodically to bound memory.
#[derive(Debug)]
pub struct OverrideRegistry {
    overrides: DashMap<String, Override>,
    clock: Clock,
}

impl Default for OverrideRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            overrides: DashMap::new(),
            clock,
        }
    }

    pub(crate) fn validate(
        shard: &str,
        rate: f64,
        ttl: Option<Duration>,
    ) -> Result<(), ThrottlerError> {
        if shard.is_empty() {
            return Err(ThrottlerError::EmptyShardId);
        }
        if !rate.is_finite() || rate < 0.0 {
            return Err(ThrottlerError::InvalidRate {
                shard: shard.to_owned(),
                rate,
            });
        }
        if let Some(ttl) = ttl
            && ttl.is_zero()
        {
            return Err(ThrottlerError::InvalidTtl {
                shard: shard.to_owned(),
                ttl,
            });
        }
        Ok(())
    }

    /// Pin `shard` to `rate`, optionally for `ttl`.
    ///
    /// Returns the active override that was replaced, if any.
    pub fn set_override(
        &self,
        shard: &str,
        rate: f64,
        ttl: Option<Duration>,
    ) -> Result<Option<Override>, ThrottlerError> {
        Self::validate(shard, rate, ttl)?;

        let now = self.clock.now();
        let pinned = Override {
            pinned_rate: rate,
            // A ttl too large to represent never expires
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };
        let previous = self.overrides.insert(shard.to_owned(), pinned);
        Ok(previous.filter(|p| p.is_active(now)))
    }

    /// Remove the override for `shard`. Clearing an absent override is a no-op.
    pub fn clear_override(&self, shard: &str) -> Option<Override> {
        let now = self.clock.now();
        self.overrides
            .remove(shard)
            .map(|(_, o)| o)
            .filter(|o| o.is_active(now))
    }

    /// The active override for `shard`. An expired entry is removed on the way out.
    pub fn get(&self, shard: &str) -> Option<Override> {
        let now = self.clock.now();
        let current = self.overrides.get(shard).map(|o| *o);
        match current {
            Some(o) if o.is_active(now) => Some(o),
            Some(_) => {
                // Only remove what is still expired; a concurrent set may have replaced it
                self.overrides.remove_if(shard, |_, o| !o.is_active(now));
                None
            }
            None => None,
        }
    }

    /// The pinned rate for `shard` if an override is active, otherwise `computed`.
    pub fn effective_rate(&self, shard: &str, computed: f64) -> f64 {
        self.get(shard).map_or(computed, |o| o.pinned_rate)
    }

    /// Drop every expired override. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        self.overrides.retain(|_, o| {
            let keep = o.is_active(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    /// Shards with an active override, sorted.
    pub fn shards(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut shards: Vec<String> = self
            .overrides
            .iter()
            .filter(|e| e.value().is_active(now))
            .map(|e| e.key().clone())
            .collect();
        shards.sort_unstable();
        shards
    }

    /// Entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Active overrides with their remaining ttl, sorted by shard.
    pub fn snapshot(&self) -> Vec<OverrideSnapshot> {
        let now = self.clock.now();
        let mut snapshot: Vec<OverrideSnapshot> = self
            .overrides
            .iter()
            .filter(|e| e.value().is_active(now))
            .map(|e| OverrideSnapshot {
                shard: e.key().clone(),
                rate: e.value().pinned_rate,
                // Round up so an override with sub-millisecond life left stays valid
                ttl_ms: e
                    .value()
                    .remaining(now)
                    .map(|left| left.as_nanos().div_ceil(1_000_000) as u64),
            })
            .collect();
        snapshot.sort_unstable_by(|a, b| a.shard.cmp(&b.shard));
        snapshot
    }

    /// Install every override in `snapshots`. Stops at the first invalid entry.
    pub fn restore(
        &self,
        snapshots: impl IntoIterator<Item = OverrideSnapshot>,
    ) -> Result<usize, ThrottlerError> {
        let mut restored = 0;
        for snapshot in snapshots {
            self.set_override(
                &snapshot.shard,
                snapshot.rate,
                snapshot.ttl_ms.map(Duration::from_millis),
            )?;
            restored += 1;
        }
        Ok(restored)
    }
}
