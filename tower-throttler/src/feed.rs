use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::global;
use shard_limit::Clock;
use shard_limit::Instant;
use shard_limit::Throttler;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::ServiceError;

/// One load or lag observation reported by a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSample {
    pub shard_id: String,
    pub value: f64,
    pub timestamp: Instant,
}

impl SignalSample {
    pub fn new(shard_id: impl Into<String>, value: f64, timestamp: Instant) -> Self {
        Self {
            shard_id: shard_id.into(),
            value,
            timestamp,
        }
    }
}

/// Totals from an ingest task that has finished draining its feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub recorded: u64,
    pub dropped: u64,
}

/// An asynchronous, bounded entry point for signal samples.
///
/// Producers push samples into a channel and a single ingest task records them,
/// so a reporter never contends with the recompute loop for a shard's lock.
/// When every `SampleFeed` clone is dropped the task records whatever is still
/// queued and then exits with its [`IngestStats`].
#[derive(Debug, Clone)]
pub struct SampleFeed {
    tx: mpsc::Sender<SignalSample>,
    clock: Clock,
}

impl SampleFeed {
    pub fn spawn(
        throttler: Arc<Throttler>,
        capacity: NonZeroUsize,
    ) -> (Self, JoinHandle<IngestStats>) {
        let (tx, rx) = mpsc::channel(capacity.get());
        let clock = throttler.clock().clone();
        let task = tokio::spawn(ingest(throttler, rx));
        (Self { tx, clock }, task)
    }

    /// Queue a sample, waiting for room if the feed is full.
    pub async fn send(&self, sample: SignalSample) -> Result<(), ServiceError> {
        self.tx
            .send(sample)
            .await
            .map_err(|_| ServiceError::FeedClosed)
    }

    /// Queue a sample without waiting. A full feed sheds the sample.
    pub fn try_send(&self, sample: SignalSample) -> Result<(), ServiceError> {
        self.tx.try_send(sample).map_err(|err| match err {
            TrySendError::Full(_) => ServiceError::Overloaded,
            TrySendError::Closed(_) => ServiceError::FeedClosed,
        })
    }

    /// Queue a sample stamped with the throttler's clock.
    pub async fn record(&self, shard_id: impl Into<String>, value: f64) -> Result<(), ServiceError> {
        let sample = SignalSample::new(shard_id, value, self.clock.now());
        self.send(sample).await
    }

    /// Like [`SampleFeed::record`], but sheds the sample if the feed is full.
    pub fn try_record(&self, shard_id: impl Into<String>, value: f64) -> Result<(), ServiceError> {
        self.try_send(SignalSample::new(shard_id, value, self.clock.now()))
    }
}

async fn ingest(throttler: Arc<Throttler>, mut rx: mpsc::Receiver<SignalSample>) -> IngestStats {
    let dropped_counter = global::meter("throttler_service")
        .u64_counter("throttler.samples_dropped")
        .build();

    let mut stats = IngestStats::default();
    while let Some(sample) = rx.recv().await {
        match throttler.record(&sample.shard_id, sample.value, sample.timestamp) {
            ControlFlow::Continue(()) => stats.recorded += 1,
            ControlFlow::Break(reason) => {
                stats.dropped += 1;
                dropped_counter.add(1, &[KeyValue::new("reason", reason.as_str())]);
            }
        }
    }

    tracing::debug!(
        recorded = stats.recorded,
        dropped = stats.dropped,
        "sample feed closed"
    );
    stats
}
