//! # Tower Throttler
//!
//! `tower-throttler` puts a [`shard_limit::Throttler`] behind a
//! [Tower](https://github.com/tower-rs/tower) RPC surface and keeps its rates moving.
//!
//! ## Components
//!
//! 1. **RPC Surface**: [`ThrottlerService`] answers the two throttler methods,
//!    `MaxRates` and `SetMaxRate`, for any [`ThrottlerApi`]. Validation failures come
//!    back inside a [`SetMaxRateResponse`], never as a service error.
//! 2. **The Managed Stack**: [`ManagedThrottlerLayer`] bounds the number of in-flight
//!    requests, sheds the excess with `ServiceError::Overloaded` and fails slow calls
//!    with `ServiceError::Timeout`.
//! 3. **Recompute Driver**: [`RecomputeDriver`] runs the control loop on a tokio
//!    interval, visiting shards round-robin within a per-tick budget.
//! 4. **Sample Feed**: [`SampleFeed`] is a bounded channel in front of the sample
//!    store for producers that should not block on recording.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`ServiceError`], allowing automatic conversion
//!   to HTTP status codes (408, 503, 500).

mod driver;
mod error;
mod feed;
mod managed_layer;
mod rpc;
mod service;

#[cfg(test)]
mod tests;

pub use driver::RecomputeDriver;
pub use driver::RecomputeHandle;
pub use driver::TickReport;
pub use driver::Ticker;
pub use error::ServiceError;
pub use feed::IngestStats;
pub use feed::SampleFeed;
pub use feed::SignalSample;
pub use managed_layer::ManagedThrottlerLayer;
pub use rpc::MaxRatesRequest;
pub use rpc::MaxRatesResponse;
pub use rpc::Method;
pub use rpc::SetMaxRateRequest;
pub use rpc::SetMaxRateResponse;
pub use rpc::ThrottlerApi;
pub use rpc::ThrottlerRequest;
pub use rpc::ThrottlerResponse;
pub use rpc::UnknownMethod;
pub use service::ThrottlerService;
