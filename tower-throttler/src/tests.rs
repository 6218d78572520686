use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use shard_limit::Clock;
use shard_limit::Throttler;
use shard_limit::ThrottlerConfig;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;
use tracing_test::traced_test;

use super::*;

fn mock_throttler(config: ThrottlerConfig) -> (Arc<Throttler>, Arc<quanta::Mock>) {
    let (clock, mock) = Clock::mock();
    // A zeroed mock clock cannot express "retention ago"
    mock.increment(Duration::from_secs(100));
    let throttler = Throttler::with_clock(config, clock).unwrap();
    (Arc::new(throttler), mock)
}

fn service_error(err: BoxError) -> ServiceError {
    err.downcast_ref::<ServiceError>()
        .cloned()
        .unwrap_or_else(|| panic!("not a ServiceError: {err}"))
}

#[tokio::test]
async fn test_service_dispatches_both_methods() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let mut service = ThrottlerService::new(Arc::clone(&throttler));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(SetMaxRateRequest::set("shardA", 25.0).into())
        .await
        .unwrap();
    assert_eq!(response.method(), Method::SetMaxRate);
    assert_eq!(response.into_set_max_rate(), Some(SetMaxRateResponse::ok()));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::new(["shardA", "shardZ"]).into())
        .await
        .unwrap()
        .into_max_rates()
        .unwrap();
    assert_eq!(response.rates.len(), 2);
    assert_eq!(response.rates["shardA"], 25.0);
    assert_eq!(response.rates["shardZ"], throttler.config().default_rate);
}

#[tokio::test]
async fn test_validation_failures_are_responses_not_errors() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let mut service = ThrottlerService::new(throttler);

    for request in [
        SetMaxRateRequest::set("shardA", -5.0),
        SetMaxRateRequest::set("shardA", f64::NAN),
        SetMaxRateRequest::set("", 5.0),
        SetMaxRateRequest::set("shardA", 5.0).with_ttl(Duration::ZERO),
        SetMaxRateRequest {
            rate: None,
            ..SetMaxRateRequest::set("shardA", 5.0)
        },
    ] {
        let response = service
            .ready()
            .await
            .unwrap()
            .call(request.clone().into())
            .await
            .expect("validation failures should not fail the call")
            .into_set_max_rate()
            .unwrap();
        assert!(!response.ok, "{request:?} should have been rejected");
        assert!(response.error_message.is_some());
    }
}

#[tokio::test]
async fn test_service_over_a_trait_object() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let api: Arc<dyn ThrottlerApi> = throttler;
    let service = ThrottlerService::new(api);

    let response = service
        .oneshot(MaxRatesRequest::default().into())
        .await
        .unwrap()
        .into_max_rates()
        .unwrap();
    assert!(response.rates.is_empty());
}

#[tokio::test]
async fn test_managed_layer_passes_requests_through() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let mut service = ServiceBuilder::new()
        .layer(ManagedThrottlerLayer::<ThrottlerRequest>::new(
            Duration::from_millis(100),
            4,
        ))
        .service(ThrottlerService::new(throttler));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(SetMaxRateRequest::set("shardA", 7.0).into())
        .await
        .unwrap();
    assert_eq!(response.into_set_max_rate(), Some(SetMaxRateResponse::ok()));

    let response = service
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::new(["shardA"]).into())
        .await
        .unwrap();
    assert_eq!(response.into_max_rates().unwrap().rates["shardA"], 7.0);
}

#[tokio::test]
async fn test_managed_layer_sheds_excess_in_flight_requests() {
    let (mock, mut handle) = tower_test::mock::pair::<ThrottlerRequest, ThrottlerResponse>();
    let layer = ManagedThrottlerLayer::<ThrottlerRequest>::new(Duration::from_secs(10), 1);
    let service = layer.layer(mock);

    let mut first = service.clone();
    let in_flight = first
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::new(["shardA"]).into());

    // The only permit is held by `in_flight`
    let mut second = service.clone();
    let err = second
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::new(["shardB"]).into())
        .await
        .unwrap_err();
    assert!(matches!(service_error(err), ServiceError::Overloaded));

    let (request, send_response) = handle.next_request().await.unwrap();
    assert_eq!(request, MaxRatesRequest::new(["shardA"]).into());
    send_response.send_response(ThrottlerResponse::MaxRates(MaxRatesResponse::default()));
    assert!(in_flight.await.is_ok());
}

#[tokio::test]
async fn test_managed_layer_sheds_when_inner_is_not_ready() {
    let (mock, mut handle) = tower_test::mock::pair::<ThrottlerRequest, ThrottlerResponse>();
    handle.allow(0);
    let mut service =
        ManagedThrottlerLayer::<ThrottlerRequest>::new(Duration::from_secs(10), 8).layer(mock);

    let err = service
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::default().into())
        .await
        .unwrap_err();
    assert!(matches!(service_error(err), ServiceError::Overloaded));
}

#[tokio::test(start_paused = true)]
async fn test_managed_layer_times_out_slow_handlers() {
    let (mock, _handle) = tower_test::mock::pair::<ThrottlerRequest, ThrottlerResponse>();
    let mut service =
        ManagedThrottlerLayer::<ThrottlerRequest>::new(Duration::from_millis(50), 8).layer(mock);

    // `_handle` never answers
    let err = service
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::default().into())
        .await
        .unwrap_err();
    assert!(matches!(service_error(err), ServiceError::Timeout));
}

#[tokio::test]
async fn test_managed_layer_wraps_inner_errors() {
    let (mock, mut handle) = tower_test::mock::pair::<ThrottlerRequest, ThrottlerResponse>();
    let mut service =
        ManagedThrottlerLayer::<ThrottlerRequest>::new(Duration::from_secs(10), 8).layer(mock);

    let response = service
        .ready()
        .await
        .unwrap()
        .call(MaxRatesRequest::default().into());
    let (_, send_response) = handle.next_request().await.unwrap();
    send_response.send_error("boom");

    match service_error(response.await.unwrap_err()) {
        ServiceError::Inner(message) => assert_eq!(message, "boom"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_recomputes_on_every_tick() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let config = throttler.config().clone();
    let _ = throttler.record_now("shardA", 10.0);

    let handle = RecomputeDriver::new(Arc::clone(&throttler))
        .with_period(Duration::from_secs(1))
        .spawn();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let ticks = handle.shutdown().await;

    // The first tick fires immediately
    assert!(ticks >= 3, "only {ticks} ticks");
    let rate = throttler.current_rate("shardA");
    assert!(rate > config.initial_rate);
    assert_eq!(
        rate,
        config.initial_rate + ticks as f64 * config.increase_step
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_handle_stops_the_driver() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let _ = throttler.record_now("shardA", 10.0);

    let handle = RecomputeDriver::new(Arc::clone(&throttler))
        .with_period(Duration::from_secs(1))
        .spawn();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    drop(handle);
    tokio::task::yield_now().await;

    let rate = throttler.current_rate("shardA");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(throttler.current_rate("shardA"), rate);
}

#[test]
#[traced_test]
fn test_ticker_defers_shards_past_its_budget() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let _ = throttler.record_now("shardA", 10.0);
    throttler.register("shardB");
    throttler.register("shardC");

    let mut ticker = Ticker::new(throttler).with_budget(Duration::ZERO);

    // One shard per tick, resuming where the previous tick stopped
    let report = ticker.tick();
    assert_eq!((report.visited, report.adjusted, report.deferred), (1, 1, 2));
    let report = ticker.tick();
    assert_eq!((report.visited, report.skipped, report.deferred), (1, 1, 2));
    let report = ticker.tick();
    assert_eq!((report.visited, report.skipped, report.deferred), (1, 1, 2));
    let report = ticker.tick();
    assert_eq!((report.visited, report.adjusted, report.deferred), (1, 1, 2));

    assert!(logs_contain("recompute tick exceeded its budget"));
}

#[test]
fn test_ticker_visits_every_shard_within_budget() {
    let (throttler, mock) = mock_throttler(ThrottlerConfig::default());
    let _ = throttler.record_now("shardA", 10.0);
    let _ = throttler.record_now("shardB", 500.0);
    throttler.register("shardC");
    throttler
        .set_max_rate("shardD", 3.0, Some(Duration::from_secs(1)))
        .unwrap();

    let mut ticker = Ticker::new(Arc::clone(&throttler)).with_budget(Duration::from_secs(60));
    let report = ticker.tick();
    assert_eq!(
        report,
        TickReport {
            visited: 4,
            adjusted: 2,
            skipped: 2,
            deferred: 0,
            purged: 0,
        }
    );

    mock.increment(Duration::from_secs(2));
    assert_eq!(ticker.tick().purged, 1);
    assert!(throttler.overrides().is_empty());
}

#[tokio::test]
async fn test_feed_drains_after_the_last_sender_drops() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let (feed, task) = SampleFeed::spawn(Arc::clone(&throttler), NonZeroUsize::new(4).unwrap());

    for i in 0..10 {
        feed.record(format!("shard{}", i % 3), 10.0).await.unwrap();
    }
    feed.record("shard0", f64::NAN).await.unwrap();
    drop(feed);

    let stats = task.await.unwrap();
    assert_eq!(stats, IngestStats { recorded: 10, dropped: 1 });
    assert_eq!(throttler.store().len(), 3);
    assert_eq!(throttler.dropped_samples(), 1);
    assert!(throttler.is_registered("shard2"));
}

#[tokio::test]
async fn test_feed_sheds_when_full_and_reports_closure() {
    let (throttler, _mock) = mock_throttler(ThrottlerConfig::default());
    let now = throttler.now();
    let (feed, task) = SampleFeed::spawn(throttler, NonZeroUsize::new(1).unwrap());

    // The ingest task has not been polled yet on this runtime
    feed.try_send(SignalSample::new("shardA", 1.0, now)).unwrap();
    let err = feed
        .try_send(SignalSample::new("shardA", 2.0, now))
        .unwrap_err();
    assert!(matches!(err, ServiceError::Overloaded));

    task.abort();
    let _ = task.await;
    let err = feed
        .send(SignalSample::new("shardA", 3.0, now))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::FeedClosed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overrides_are_visible_while_the_driver_runs() {
    let throttler = Arc::new(Throttler::new(ThrottlerConfig::default()).unwrap());
    let driver = RecomputeDriver::new(Arc::clone(&throttler))
        .with_period(Duration::from_millis(1))
        .spawn();
    let service = ThrottlerService::new(Arc::clone(&throttler));

    let mut handles = vec![];
    for task in 0..8 {
        let throttler = Arc::clone(&throttler);
        let mut service = service.clone();
        handles.push(tokio::spawn(async move {
            let shard = format!("shard{task}");
            for i in 0..50 {
                let _ = throttler.record_now(&shard, 500.0);
                let rate = (task * 100 + i) as f64;
                let response = service
                    .ready()
                    .await
                    .unwrap()
                    .call(SetMaxRateRequest::set(shard.clone(), rate).into())
                    .await
                    .unwrap();
                assert_eq!(response.into_set_max_rate(), Some(SetMaxRateResponse::ok()));

                let rates = service
                    .ready()
                    .await
                    .unwrap()
                    .call(MaxRatesRequest::new([shard.clone()]).into())
                    .await
                    .unwrap()
                    .into_max_rates()
                    .unwrap()
                    .rates;
                assert_eq!(rates[&shard], rate);
                tokio::task::yield_now().await;
            }
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked");
    }
    assert!(driver.shutdown().await > 0);
}
