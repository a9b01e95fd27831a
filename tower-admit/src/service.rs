use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;

use admit_limit::CallerContext;
use admit_limit::Policy;
use admit_limit::RateLimiter;
use admit_limit::RecordStore;

use crate::error::AdmitError;

#[derive(Clone, Debug)]
struct AdmitServiceMetrics {
    admitted: Counter<u64>,
    denied: Counter<u64>,
}

/// Middleware service that gates each request on an admission decision.
///
/// `F` extracts the caller context and endpoint name from a request; the
/// middleware stays ignorant of the request type beyond that.
pub struct AdmitService<S, F, V> {
    inner: V,
    limiter: Arc<RateLimiter<S>>,
    policy: Policy,
    extract: F,
    instruments: AdmitServiceMetrics,
}

impl<S, F, V> AdmitService<S, F, V> {
    pub fn new(inner: V, limiter: Arc<RateLimiter<S>>, policy: Policy, extract: F) -> Self {
        let meter = global::meter("admit_service");
        let instruments = AdmitServiceMetrics {
            admitted: meter.u64_counter("admitted").build(),
            denied: meter.u64_counter("denied").build(),
        };

        Self {
            inner,
            limiter,
            policy,
            extract,
            instruments,
        }
    }
}

impl<S, F, V> Clone for AdmitService<S, F, V>
where
    F: Clone,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            policy: self.policy.clone(),
            extract: self.extract.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, F, V, Req> Service<Req> for AdmitService<S, F, V>
where
    S: RecordStore + 'static,
    F: Fn(&Req) -> (CallerContext, String),
    V: Service<Req, Error = BoxError> + Clone + Send + 'static,
    V::Future: Send,
    Req: Send + 'static,
{
    type Response = V::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let (ctx, endpoint) = (self.extract)(&req);
        let limiter = Arc::clone(&self.limiter);
        let policy = self.policy.clone();
        let instruments = self.instruments.clone();

        // Take the service that was driven to readiness; leave a fresh
        // clone behind for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter.check(&ctx, &endpoint, &policy).await;
            if decision.allowed {
                instruments
                    .admitted
                    .add(1, &[KeyValue::new("endpoint", endpoint)]);
                inner.call(req).await
            } else {
                instruments
                    .denied
                    .add(1, &[KeyValue::new("endpoint", endpoint)]);
                Err(Box::new(AdmitError::RateLimited {
                    retry_after: decision.retry_after.unwrap_or_default(),
                    message: decision.denial_message(),
                }) as BoxError)
            }
        })
    }
}
