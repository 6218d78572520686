use std::marker::PhantomData;
use std::time::Duration;

use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneService;

use crate::ServiceError;

/// A bounded, non-blocking stack for throttler RPC handlers.
///
/// The inner service is wrapped in a concurrency limit, load shedding and a
/// deadline, so no handler waits indefinitely:
///
/// ### Error Responsibilities:
/// - **LoadShedding (`ServiceError::Overloaded`)**: more than `max_in_flight`
///   requests are outstanding. The excess request is rejected immediately
///   instead of queueing.
/// - **Timeout (`ServiceError::Timeout`)**: the inner service did not respond
///   within `max_wait`.
/// - **Inner (`ServiceError::Inner`)**: any other error from the inner service.
pub struct ManagedThrottlerLayer<Req> {
    max_wait: Duration,
    max_in_flight: usize,
    _phantom: PhantomData<fn(Req)>,
}

// Derived Clone would demand Req: Clone
impl<Req> Clone for ManagedThrottlerLayer<Req> {
    fn clone(&self) -> Self {
        Self {
            max_wait: self.max_wait,
            max_in_flight: self.max_in_flight,
            _phantom: PhantomData,
        }
    }
}

impl<S, Req> Layer<S> for ManagedThrottlerLayer<Req>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        // Timeout is outer to ensure a hard deadline on the entire process.
        let svc = tower::ServiceBuilder::new()
            .timeout(self.max_wait)
            .load_shed()
            .concurrency_limit(self.max_in_flight)
            .service(inner);

        // Map the mixed errors into ServiceError
        let mapped_svc = tower::util::MapErr::new(svc, |err: BoxError| {
            if err.is::<tower::timeout::error::Elapsed>() {
                BoxError::from(ServiceError::Timeout)
            } else if err.is::<tower::load_shed::error::Overloaded>() {
                BoxError::from(ServiceError::Overloaded)
            } else if err.is::<ServiceError>() {
                err
            } else {
                // Wrap any other inner service errors
                Box::from(ServiceError::Inner(err.to_string()))
            }
        });

        BoxCloneService::new(mapped_svc)
    }
}

impl<Req> ManagedThrottlerLayer<Req> {
    /// `max_in_flight` is clamped to at least one.
    pub fn new(max_wait: Duration, max_in_flight: usize) -> Self {
        Self {
            max_wait,
            max_in_flight: max_in_flight.max(1),
            _phantom: PhantomData,
        }
    }
}
