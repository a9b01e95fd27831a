use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use tower::BoxError;
use tower::Service;
use tower::ServiceBuilder;
use tower::ServiceExt;

use admit_limit::CallerContext;
use admit_limit::MemoryStore;
use admit_limit::Policy;
use admit_limit::RateLimiter;
use admit_limit::Tier;

use super::*;

use futures::future::Ready;
use futures::future::ready;

#[derive(Clone)]
struct MockService {
    pub count: Arc<AtomicUsize>,
}

impl Service<String> for MockService {
    type Response = ();
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: String) -> Self::Future {
        self.count.fetch_add(1, Ordering::SeqCst);
        ready(Ok(()))
    }
}

fn extractor(req: &String) -> (CallerContext, String) {
    (CallerContext::for_user("tester"), req.clone())
}

#[tokio::test]
async fn it_admits_under_the_limit_and_denies_over() {
    let limiter = Arc::new(RateLimiter::new(MemoryStore::new()));
    let policy = Policy::fixed_window(2, Duration::from_secs(60)).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let mut svc = ServiceBuilder::new()
        .layer(AdmitLayer::new(limiter, policy, extractor))
        .service(MockService {
            count: Arc::clone(&count),
        });

    for _ in 0..2 {
        svc.ready()
            .await
            .unwrap()
            .call("/api/items".to_string())
            .await
            .unwrap();
    }

    let err = svc
        .ready()
        .await
        .unwrap()
        .call("/api/items".to_string())
        .await
        .unwrap_err();

    let admit_err = err.downcast_ref::<AdmitError>().unwrap();
    match admit_err {
        AdmitError::RateLimited {
            retry_after,
            message,
        } => {
            assert!(*retry_after > Duration::ZERO);
            assert!(message.contains("Rate limit exceeded"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    // The inner service never saw the denied request.
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn endpoints_are_limited_independently() {
    let limiter = Arc::new(RateLimiter::new(MemoryStore::new()));
    let policy = Policy::fixed_window(1, Duration::from_secs(60)).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let mut svc = ServiceBuilder::new()
        .layer(AdmitLayer::new(limiter, policy, extractor))
        .service(MockService {
            count: Arc::clone(&count),
        });

    svc.ready()
        .await
        .unwrap()
        .call("/api/a".to_string())
        .await
        .unwrap();
    // Different endpoint, fresh quota.
    svc.ready()
        .await
        .unwrap()
        .call("/api/b".to_string())
        .await
        .unwrap();

    assert!(
        svc.ready()
            .await
            .unwrap()
            .call("/api/a".to_string())
            .await
            .is_err()
    );
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tier_from_the_extractor_scales_the_limit() {
    let limiter = Arc::new(RateLimiter::new(MemoryStore::new()));
    let policy = Policy::fixed_window(1, Duration::from_secs(60)).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let extract = |req: &String| {
        (
            CallerContext::for_user("pro-user").with_tier(Tier::Pro),
            req.clone(),
        )
    };

    let mut svc = ServiceBuilder::new()
        .layer(AdmitLayer::new(limiter, policy, extract))
        .service(MockService {
            count: Arc::clone(&count),
        });

    // Pro tier doubles the base limit of 1.
    for _ in 0..2 {
        svc.ready()
            .await
            .unwrap()
            .call("/api/items".to_string())
            .await
            .unwrap();
    }
    assert!(
        svc.ready()
            .await
            .unwrap()
            .call("/api/items".to_string())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn layers_share_one_limiter_with_distinct_policies() {
    let limiter = Arc::new(RateLimiter::new(MemoryStore::new()));
    let count = Arc::new(AtomicUsize::new(0));

    let strict = Policy::fixed_window(1, Duration::from_secs(60)).unwrap();
    let relaxed = Policy::fixed_window(100, Duration::from_secs(60)).unwrap();

    let mut strict_svc = ServiceBuilder::new()
        .layer(AdmitLayer::new(Arc::clone(&limiter), strict, extractor))
        .service(MockService {
            count: Arc::clone(&count),
        });
    let mut relaxed_svc = ServiceBuilder::new()
        .layer(AdmitLayer::new(limiter, relaxed, extractor))
        .service(MockService {
            count: Arc::clone(&count),
        });

    strict_svc
        .ready()
        .await
        .unwrap()
        .call("/api/generate".to_string())
        .await
        .unwrap();
    assert!(
        strict_svc
            .ready()
            .await
            .unwrap()
            .call("/api/generate".to_string())
            .await
            .is_err()
    );

    // The relaxed route keeps admitting.
    for _ in 0..10 {
        relaxed_svc
            .ready()
            .await
            .unwrap()
            .call("/api/reads".to_string())
            .await
            .unwrap();
    }
}
