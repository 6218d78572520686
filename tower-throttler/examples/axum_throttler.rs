use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use shard_limit::Throttler;
use shard_limit::ThrottlerConfig;
use tower::BoxError;
use tower::Layer;
use tower::ServiceExt;
use tower::util::BoxCloneService;
use tower_throttler::ManagedThrottlerLayer;
use tower_throttler::MaxRatesRequest;
use tower_throttler::RecomputeDriver;
use tower_throttler::SampleFeed;
use tower_throttler::ServiceError;
use tower_throttler::SetMaxRateRequest;
use tower_throttler::ThrottlerRequest;
use tower_throttler::ThrottlerResponse;
use tower_throttler::ThrottlerService;

type Rpc = BoxCloneService<ThrottlerRequest, ThrottlerResponse, BoxError>;

#[derive(Clone)]
struct AppState {
    // Clones share the managed stack's in-flight limit
    rpc: Arc<Mutex<Rpc>>,
    feed: SampleFeed,
}

impl AppState {
    async fn call(&self, request: ThrottlerRequest) -> Result<ThrottlerResponse, Response> {
        let rpc = self.rpc.lock().unwrap().clone();
        rpc.oneshot(request).await.map_err(handle_throttler_error)
    }
}

#[derive(Deserialize)]
struct SampleBody {
    shard_id: String,
    value: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // 1. The throttler and its control loop
    let throttler = Arc::new(Throttler::new(ThrottlerConfig::default()).unwrap());
    let driver = RecomputeDriver::new(Arc::clone(&throttler)).spawn();
    let (feed, _ingest) = SampleFeed::spawn(Arc::clone(&throttler), NonZeroUsize::new(1024).unwrap());

    // 2. The RPC surface behind the managed stack
    let rpc = ManagedThrottlerLayer::<ThrottlerRequest>::new(Duration::from_millis(50), 64)
        .layer(ThrottlerService::new(throttler));
    let state = AppState {
        rpc: Arc::new(Mutex::new(rpc)),
        feed,
    };

    // 3. Build the Router
    let app = Router::new()
        .route("/max-rates", post(max_rates))
        .route("/max-rates/{shard}", get(max_rate))
        .route("/set-max-rate", post(set_max_rate))
        .route("/samples", post(record_sample))
        .with_state(state);

    // 4. Serve
    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .unwrap();
    println!("📡 Listening on http://127.0.0.1:3000");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    driver.shutdown().await;
}

async fn max_rates(
    State(state): State<AppState>,
    Json(request): Json<MaxRatesRequest>,
) -> Result<impl IntoResponse, Response> {
    let response = state.call(request.into()).await?;
    Ok(Json(response.into_max_rates()))
}

async fn max_rate(
    State(state): State<AppState>,
    axum::extract::Path(shard): axum::extract::Path<String>,
) -> Result<impl IntoResponse, Response> {
    let response = state.call(MaxRatesRequest::new([shard]).into()).await?;
    Ok(Json(response.into_max_rates()))
}

async fn set_max_rate(
    State(state): State<AppState>,
    Json(request): Json<SetMaxRateRequest>,
) -> Result<impl IntoResponse, Response> {
    let response = state
        .call(request.into())
        .await?
        .into_set_max_rate()
        .unwrap_or_default();
    let status = if response.ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok((status, Json(response)))
}

async fn record_sample(
    State(state): State<AppState>,
    Json(body): Json<SampleBody>,
) -> Result<StatusCode, Response> {
    state
        .feed
        .try_record(body.shard_id, body.value)
        .map_err(IntoResponse::into_response)?;
    Ok(StatusCode::ACCEPTED)
}

fn handle_throttler_error(err: BoxError) -> Response {
    if let Some(err) = err.downcast_ref::<ServiceError>() {
        err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}
