/// Errors produced by the throttler's service stack.
///
/// Validation failures are not errors at this level: they are reported inside a
/// `SetMaxRateResponse` so the caller always receives a well-formed reply.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// The request did not complete within the managed layer's deadline.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for the throttler")]
    Timeout,

    /// Too many requests are in flight; this one was shed.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Throttler is overloaded; request shed")]
    Overloaded,

    /// The sample feed's ingest task has stopped.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Sample feed is closed")]
    FeedClosed,

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServiceError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Overloaded | Self::FeedClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
