use std::future::Ready;
use std::future::ready;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;

use crate::ThrottlerApi;
use crate::ThrottlerRequest;
use crate::ThrottlerResponse;

#[derive(Clone, Debug)]
struct ThrottlerServiceMetrics {
    requests: Counter<u64>,
    validation_failures: Counter<u64>,
}

/// Dispatches [`ThrottlerRequest`]s to a [`ThrottlerApi`] implementation.
///
/// Both methods are answered synchronously: the service is always ready and
/// every response future is already complete.
#[derive(Debug)]
pub struct ThrottlerService<T>
where
    T: ?Sized,
{
    api: Arc<T>,
    instruments: ThrottlerServiceMetrics,
}

impl<T> Clone for ThrottlerService<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            instruments: self.instruments.clone(),
        }
    }
}

impl<T> ThrottlerService<T>
where
    T: ?Sized,
{
    pub fn new(api: Arc<T>) -> Self {
        let meter = global::meter("throttler_service");
        let instruments = ThrottlerServiceMetrics {
            requests: meter.u64_counter("throttler.requests").build(),
            validation_failures: meter.u64_counter("throttler.validation_failures").build(),
        };

        Self { api, instruments }
    }

    pub fn api(&self) -> &Arc<T> {
        &self.api
    }
}

impl<T> Service<ThrottlerRequest> for ThrottlerService<T>
where
    T: ThrottlerApi + ?Sized,
{
    type Response = ThrottlerResponse;
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ThrottlerRequest) -> Self::Future {
        let method = req.method();
        self.instruments
            .requests
            .add(1, &[KeyValue::new("method", method.name())]);

        let response = match req {
            ThrottlerRequest::MaxRates(request) => {
                ThrottlerResponse::MaxRates(self.api.max_rates(request))
            }
            ThrottlerRequest::SetMaxRate(request) => {
                let response = self.api.set_max_rate(request);
                if !response.ok {
                    self.instruments.validation_failures.add(1, &[]);
                }
                ThrottlerResponse::SetMaxRate(response)
            }
        };

        ready(Ok(response))
    }
}
