use std::sync::Arc;
use std::time::Duration;

use shard_limit::Adjustment;
use shard_limit::Throttler;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

/// What a single recompute tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Shards recomputed this tick.
    pub visited: usize,
    /// Shards whose rate changed.
    pub adjusted: usize,
    /// Shards with no recent samples.
    pub skipped: usize,
    /// Shards left for the next tick because the budget ran out.
    pub deferred: usize,
    /// Expired overrides swept from the registry.
    pub purged: usize,
}

/// Runs recompute ticks over every known shard within a time budget.
///
/// When a tick runs out of budget the remaining shards are deferred and the
/// next tick resumes where this one stopped, so every shard is eventually
/// visited however large the fleet.
#[derive(Debug)]
pub struct Ticker {
    throttler: Arc<Throttler>,
    budget: Duration,
    cursor: usize,
}

impl Ticker {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        let budget = throttler.config().tick_budget();
        Self {
            throttler,
            budget,
            cursor: 0,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            purged: self.throttler.overrides().purge_expired(),
            ..Default::default()
        };

        let shards = self.throttler.shards();
        if shards.is_empty() {
            self.cursor = 0;
            return report;
        }

        let start = Instant::now();
        let offset = self.cursor % shards.len();
        for i in 0..shards.len() {
            // Always make progress on at least one shard
            if i > 0 && start.elapsed() >= self.budget {
                report.deferred = shards.len() - i;
                self.cursor = offset + i;
                tracing::warn!(
                    visited = report.visited,
                    deferred = report.deferred,
                    budget = ?self.budget,
                    "recompute tick exceeded its budget"
                );
                return report;
            }

            let shard = &shards[(offset + i) % shards.len()];
            match self.throttler.recompute(shard) {
                Adjustment::Skipped => report.skipped += 1,
                adjustment if adjustment.is_change() => report.adjusted += 1,
                _ => {}
            }
            report.visited += 1;
        }

        self.cursor = offset;
        report
    }
}

/// The periodic recompute loop.
#[derive(Debug)]
pub struct RecomputeDriver {
    ticker: Ticker,
    period: Duration,
}

impl RecomputeDriver {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        let period = throttler.config().tick_interval();
        Self {
            ticker: Ticker::new(throttler),
            period,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.ticker = self.ticker.with_budget(budget);
        self
    }

    /// Start ticking on the current tokio runtime.
    pub fn spawn(self) -> RecomputeHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        RecomputeHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> u64 {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period = ?self.period, "recompute driver started");

        let mut ticks = 0;
        loop {
            tokio::select! {
                biased;
                // Fires on an explicit shutdown or when the handle is dropped
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let report = self.ticker.tick();
                    ticks += 1;
                    tracing::trace!(?report, "recompute tick");
                }
            }
        }

        tracing::info!(ticks, "recompute driver stopped");
        ticks
    }
}

/// Control over a spawned [`RecomputeDriver`]. Dropping the handle stops the loop.
#[derive(Debug)]
pub struct RecomputeHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl RecomputeHandle {
    /// Stop the loop after its current tick and wait for it to exit.
    ///
    /// Returns the number of ticks that ran.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(ticks) => ticks,
            Err(err) => {
                tracing::error!(%err, "recompute driver task failed");
                0
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
