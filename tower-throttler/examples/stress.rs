use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use shard_limit::Throttler;
use shard_limit::ThrottlerConfig;
use tokio::task::JoinSet;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower_throttler::ManagedThrottlerLayer;
use tower_throttler::MaxRatesRequest;
use tower_throttler::RecomputeDriver;
use tower_throttler::SampleFeed;
use tower_throttler::ServiceError;
use tower_throttler::SetMaxRateRequest;
use tower_throttler::ThrottlerRequest;
use tower_throttler::ThrottlerService;
use tracing_subscriber::EnvFilter;

/// Hammer a throttler with samples, rate reads and overrides while its control loop runs.
#[derive(Parser, Debug)]
struct Args {
    /// Number of shards reporting load
    #[arg(long, default_value_t = 256)]
    shards: usize,

    /// Concurrent RPC clients
    #[arg(long, default_value_t = 64)]
    clients: usize,

    /// Maximum RPCs in flight before requests are shed
    #[arg(long, default_value_t = 32)]
    max_in_flight: usize,

    /// Per-request deadline
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5ms")]
    max_wait: Duration,

    /// How long to run
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
    duration: Duration,

    /// Recompute period
    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    tick: Duration,
}

#[derive(Default)]
struct Outcomes {
    ok: u64,
    rejected: u64,
    timeouts: u64,
    sheds: u64,
    other: u64,
}

fn shard_name(i: usize) -> String {
    format!("shard-{i:04}")
}

// A deterministic load pattern: some shards run hot, most run cool
fn load_for(shard: usize, round: u64) -> f64 {
    let phase = (shard as u64 + round) % 20;
    if shard % 7 == 0 {
        150.0 + phase as f64
    } else {
        20.0 + phase as f64 * 3.0
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let provider = SdkMeterProvider::builder().build();
    global::set_meter_provider(provider.clone());

    let config = ThrottlerConfig {
        tick_interval_ms: args.tick.as_millis() as u64,
        ..Default::default()
    };
    let throttler = Arc::new(Throttler::new(config)?);
    let driver = RecomputeDriver::new(Arc::clone(&throttler)).spawn();
    let (feed, ingest) = SampleFeed::spawn(Arc::clone(&throttler), NonZeroUsize::new(4096).unwrap());

    let deadline = Instant::now() + args.duration;

    let producer = {
        let shards = args.shards;
        tokio::spawn(async move {
            let mut round = 0;
            while Instant::now() < deadline {
                for shard in 0..shards {
                    if feed.record(shard_name(shard), load_for(shard, round)).await.is_err() {
                        return;
                    }
                }
                round += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let service = ManagedThrottlerLayer::<ThrottlerRequest>::new(args.max_wait, args.max_in_flight)
        .layer(ThrottlerService::new(Arc::clone(&throttler)));

    let mut clients = JoinSet::new();
    for client in 0..args.clients {
        let mut svc = service.clone();
        let shards = args.shards;
        clients.spawn(async move {
            let mut latencies = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
            let mut outcomes = Outcomes::default();
            let mut i = 0usize;
            while Instant::now() < deadline {
                let request: ThrottlerRequest = if i % 50 == 0 {
                    SetMaxRateRequest::set(shard_name((client + i) % shards), 500.0)
                        .with_ttl(Duration::from_millis(250))
                        .into()
                } else {
                    MaxRatesRequest::new((0..8).map(|k| shard_name((client * 8 + i + k) % shards)))
                        .into()
                };
                i += 1;

                let start = Instant::now();
                let result = match svc.ready().await {
                    Ok(ready) => ready.call(request).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(response) => {
                        latencies.record(start.elapsed().as_micros() as u64)?;
                        match response.into_set_max_rate() {
                            Some(set) if !set.ok => outcomes.rejected += 1,
                            _ => outcomes.ok += 1,
                        }
                    }
                    Err(err) => match err.downcast_ref::<ServiceError>() {
                        Some(ServiceError::Timeout) => outcomes.timeouts += 1,
                        Some(ServiceError::Overloaded) => outcomes.sheds += 1,
                        _ => outcomes.other += 1,
                    },
                }
                tokio::task::yield_now().await;
            }
            Ok::<_, BoxError>((latencies, outcomes))
        });
    }

    let mut latencies = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut totals = Outcomes::default();
    while let Some(result) = clients.join_next().await {
        let (hist, outcomes) = result??;
        latencies.add(hist)?;
        totals.ok += outcomes.ok;
        totals.rejected += outcomes.rejected;
        totals.timeouts += outcomes.timeouts;
        totals.sheds += outcomes.sheds;
        totals.other += outcomes.other;
    }

    producer.await?;
    let stats = ingest.await?;
    let ticks = driver.shutdown().await;

    let rates = throttler.all_max_rates();
    let hot = rates
        .iter()
        .filter(|(shard, _)| {
            shard
                .trim_start_matches("shard-")
                .parse::<usize>()
                .is_ok_and(|i| i % 7 == 0)
        })
        .map(|(_, rate)| *rate);
    let (hot_count, hot_sum) = hot.fold((0usize, 0.0), |(n, sum), rate| (n + 1, sum + rate));

    println!("--- Throttler Stress ({:?}) ---", args.duration);
    println!("Recompute Ticks: {ticks}");
    println!("Samples:         {} recorded, {} dropped", stats.recorded, stats.dropped);
    println!("Shards:          {}", rates.len());
    if hot_count > 0 {
        println!("Hot Shard Rate:  {:.1} (mean)", hot_sum / hot_count as f64);
    }
    println!("RPCs OK:         {}", totals.ok);
    println!("Rejected:        {}", totals.rejected);
    println!("Errors:          {}", totals.timeouts + totals.sheds + totals.other);
    println!("  └─ Timeouts:   {}", totals.timeouts);
    println!("  └─ LoadSheds:  {}", totals.sheds);
    if totals.other > 0 {
        println!("  └─ Other:      {}", totals.other);
    }
    if !latencies.is_empty() {
        println!("P50 (Elapsed):   {}µs", latencies.value_at_quantile(0.5));
        println!("P99 (Elapsed):   {}µs", latencies.value_at_quantile(0.99));
    }

    provider.shutdown()?;
    Ok(())
}
