use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

/// A single load or lag observation for a shard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Instant,
    pub value: f64,
}

/// Reasons a sample is discarded instead of recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dropped {
    /// The sample is further behind the newest recorded sample than the skew tolerance allows.
    Stale { behind: Duration },
    /// The sample is further ahead of now than the skew tolerance allows.
    Future { ahead: Duration },
    /// The sample is already outside the retention window.
    Expired,
    /// The value is NaN or infinite.
    NotFinite,
}

impl Dropped {
    /// A short, stable label suitable for logs and metric attributes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dropped::Stale { .. } => "stale",
            Dropped::Future { .. } => "future",
            Dropped::Expired => "expired",
            Dropped::NotFinite => "not_finite",
        }
    }
}

#[derive(Debug, Default)]
struct SampleWindow {
    samples: VecDeque<Sample>,
}

impl SampleWindow {
    fn newest(&self) -> Option<Instant> {
        self.samples.back().map(|s| s.timestamp)
    }

    fn evict(&mut self, cutoff: Option<Instant>) {
        let Some(cutoff) = cutoff else {
            return;
        };
        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
    }

    fn insert(&mut self, sample: Sample) {
        match self.samples.back() {
            Some(last) if last.timestamp > sample.timestamp => {
                // Late but within tolerance: keep the sequence ordered
                let idx = self
                    .samples
                    .partition_point(|s| s.timestamp <= sample.timestamp);
                self.samples.insert(idx, sample);
            }
            _ => self.samples.push_back(sample),
        }
    }
}

/// A view over the samples of one shard that fall inside a window, oldest first.
///
/// The view only exists inside [`SampleStore::with_recent_samples`], while the
/// shard's lock is held. Iteration is lazy and can be restarted any number of
/// times.
#[derive(Debug, Clone, Copy)]
pub struct RecentSamples<'a> {
    samples: Option<&'a VecDeque<Sample>>,
    since: Option<Instant>,
}

impl<'a> RecentSamples<'a> {
    pub fn iter(self) -> impl Iterator<Item = &'a Sample> {
        let since = self.since;
        self.samples
            .into_iter()
            .flatten()
            .skip_while(move |s| since.is_some_and(|since| s.timestamp < since))
    }

    pub fn values(self) -> impl Iterator<Item = f64> {
        self.iter().map(|s| s.value)
    }

    pub fn newest(self) -> Option<Sample> {
        self.iter().last().copied()
    }

    pub fn len(self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(self) -> bool {
        self.iter().next().is_none()
    }
}

/// Bounded, time-ordered sample history per shard.
///
/// Each shard has its own lock, created the first time a sample is recorded
/// for it, so writers for different shards never contend.
#[derive(Debug)]
pub struct SampleStore {
    shards: DashMap<String, Arc<Mutex<SampleWindow>>>,
    retention: Duration,
    skew_tolerance: Duration,
    capacity: usize,
    clock: Clock,
}

impl SampleStore {
    pub fn new(retention: Duration, skew_tolerance: Duration, capacity: NonZeroUsize) -> Self {
        Self::with_clock(retention, skew_tolerance, capacity, Clock::new())
    }

    pub fn with_clock(
        retention: Duration,
        skew_tolerance: Duration,
        capacity: NonZeroUsize,
        clock: Clock,
    ) -> Self {
        Self {
            shards: DashMap::new(),
            retention,
            skew_tolerance,
            capacity: capacity.get(),
            clock,
        }
    }

    fn window(&self, shard: &str) -> Option<Arc<Mutex<SampleWindow>>> {
        self.shards.get(shard).map(|w| Arc::clone(w.value()))
    }

    fn window_or_insert(&self, shard: &str) -> Arc<Mutex<SampleWindow>> {
        match self.window(shard) {
            Some(window) => window,
            None => Arc::clone(self.shards.entry(shard.to_owned()).or_default().value()),
        }
    }

    /// Append a sample for `shard`.
    ///
    /// Samples arriving more than the skew tolerance behind the newest sample
    /// are dropped rather than reordering history. Samples stamped more than
    /// the skew tolerance ahead of now are dropped too: once recorded they would
    /// become the newest sample and push every honest report out as stale.
    pub fn record(&self, shard: &str, value: f64, timestamp: Instant) -> ControlFlow<Dropped> {
        if !value.is_finite() {
            return ControlFlow::Break(Dropped::NotFinite);
        }

        let now = self.clock.now();
        let ahead = timestamp.saturating_duration_since(now);
        if ahead > self.skew_tolerance {
            return ControlFlow::Break(Dropped::Future { ahead });
        }

        let cutoff = now.checked_sub(self.retention);
        if cutoff.is_some_and(|cutoff| timestamp < cutoff) {
            return ControlFlow::Break(Dropped::Expired);
        }

        let window = self.window_or_insert(shard);
        let mut window = window.lock();

        if let Some(newest) = window.newest() {
            let behind = newest.saturating_duration_since(timestamp);
            if behind > self.skew_tolerance {
                return ControlFlow::Break(Dropped::Stale { behind });
            }
        }

        window.insert(Sample { timestamp, value });
        window.evict(cutoff);
        while window.samples.len() > self.capacity {
            window.samples.pop_front();
        }
        ControlFlow::Continue(())
    }

    /// Run `f` over the samples of `shard` recorded within `window` of now.
    ///
    /// `f` runs inside the shard's critical section: no sample can be recorded
    /// for this shard until it returns.
    pub fn with_recent_samples<R>(
        &self,
        shard: &str,
        window: Duration,
        f: impl FnOnce(RecentSamples<'_>) -> R,
    ) -> R {
        let now = self.clock.now();
        let since = now.checked_sub(window);
        let Some(samples) = self.window(shard) else {
            return f(RecentSamples {
                samples: None,
                since,
            });
        };

        let mut guard = samples.lock();
        guard.evict(now.checked_sub(self.retention));
        f(RecentSamples {
            samples: Some(&guard.samples),
            since,
        })
    }

    /// Owned copy of the samples of `shard` recorded within `window` of now.
    pub fn recent_samples(&self, shard: &str, window: Duration) -> Vec<Sample> {
        self.with_recent_samples(shard, window, |samples| {
            samples.iter().copied().collect()
        })
    }

    /// Forget every sample for `shard`. Returns whether the shard was known.
    pub fn remove(&self, shard: &str) -> bool {
        self.shards.remove(shard).is_some()
    }

    /// Shards with a sample history.
    pub fn shards(&self) -> Vec<String> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}
