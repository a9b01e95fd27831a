use std::sync::Arc;

use tower::Layer;

use admit_limit::Policy;
use admit_limit::RateLimiter;

use crate::service::AdmitService;

/// Applies admission control to requests.
///
/// Construct with a shared [`RateLimiter`], the [`Policy`] guarding this
/// route, and an extractor that derives an [`admit_limit::CallerContext`]
/// and endpoint name from a request. One limiter is typically shared by
/// many layers, each carrying
/// its own policy.
pub struct AdmitLayer<S, F> {
    limiter: Arc<RateLimiter<S>>,
    policy: Policy,
    extract: F,
}

impl<S, F> AdmitLayer<S, F> {
    pub fn new(limiter: Arc<RateLimiter<S>>, policy: Policy, extract: F) -> Self {
        Self {
            limiter,
            policy,
            extract,
        }
    }
}

impl<S, F> Clone for AdmitLayer<S, F>
where
    F: Clone,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            policy: self.policy.clone(),
            extract: self.extract.clone(),
        }
    }
}

impl<S, F, V> Layer<V> for AdmitLayer<S, F>
where
    F: Clone,
{
    type Service = AdmitService<S, F, V>;

    fn layer(&self, service: V) -> Self::Service {
        AdmitService::new(
            service,
            Arc::clone(&self.limiter),
            self.policy.clone(),
            self.extract.clone(),
        )
    }
}
