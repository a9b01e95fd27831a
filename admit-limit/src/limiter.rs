use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::Outcome;
use crate::RateLimitRecord;
use crate::Strategy;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::fixed_window::FixedWindow;
use crate::identity::CallerContext;
use crate::identity::KEY_SEPARATOR;
use crate::identity::identify;
use crate::policy::EffectivePolicy;
use crate::policy::Policy;
use crate::policy::StrategyKind;
use crate::sliding_window::SlidingWindow;
use crate::store::RecordStore;
use crate::store::StoreError;
use crate::token_bucket::TokenBucket;

/// What `check` does when the record store is unreachable (or write races
/// exhaust their retries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Admit the request. Blocking all traffic because a store is down is
    /// worse than temporarily under-enforcing a quota, so this is the
    /// default.
    #[default]
    Open,
    /// Reject the request. For security-sensitive endpoints such as
    /// authentication, where under-enforcing is the worse outcome.
    Closed,
}

/// The outcome of an admission check, with the quota fields the HTTP layer
/// exposes as response metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// The effective limit for this caller.
    pub limit: u32,
    /// Admissions left in the current window.
    pub remaining: u32,
    /// When the quota resets, milliseconds since the UNIX epoch.
    pub reset_at_ms: u64,
    /// How long a denied caller should wait before retrying.
    pub retry_after: Option<Duration>,
}

impl Decision {
    /// Human-readable text for a 429-class response body.
    pub fn denial_message(&self) -> String {
        match self.retry_after {
            Some(wait) => format!(
                "Rate limit exceeded. Retry after {} seconds.",
                wait.as_secs().max(1)
            ),
            None => "Rate limit exceeded.".to_string(),
        }
    }

    fn from_outcome(outcome: &Outcome, limit: u32) -> Self {
        Self {
            allowed: outcome.allowed,
            limit,
            remaining: outcome.remaining,
            reset_at_ms: outcome.reset_at_ms,
            retry_after: outcome.retry_after,
        }
    }
}

/// Conditional-write retries before a check degrades to the failure mode.
/// Within one process the per-key locks already serialize checks, so
/// conflicts only come from other processes sharing a remote store.
const MAX_SET_ATTEMPTS: usize = 4;

/// Lock shards bounding contention; there is deliberately no lock spanning
/// all keys.
const LOCK_SHARDS: usize = 64;

/// The admission-control facade: identify caller → compose key → load
/// record → apply strategy → persist → decision.
///
/// Explicitly constructed and owned; inject the store at construction
/// rather than reaching for process-global state. Holds no background
/// tasks, so lifecycle is just drop.
pub struct RateLimiter<S> {
    store: S,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
    namespace: String,
    locks: Box<[Mutex<()>]>,
}

impl<S> RateLimiter<S>
where
    S: RecordStore,
{
    /// A limiter over `store` on the system clock, failing open.
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// A limiter with an injected clock, for deterministic tests.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        let locks = (0..LOCK_SHARDS)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            store,
            clock,
            failure_mode: FailureMode::Open,
            namespace: "rl".to_string(),
            locks,
        }
    }

    /// Set the store-outage behavior. See [`FailureMode`].
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Set the key namespace, isolating this limiter's records from others
    /// sharing the same store (the burst sub-limiter uses this).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// The canonical entry point: decide one request, consuming quota when
    /// admitted.
    ///
    /// Never returns an error for a well-formed policy: a store outage or
    /// exhausted write retries degrade to the configured [`FailureMode`]
    /// and are logged, not propagated.
    pub async fn check(&self, ctx: &CallerContext, endpoint: &str, policy: &Policy) -> Decision {
        let effective = policy.resolve(ctx.tier);
        let strategy = strategy_for(policy.strategy);
        let key = self.compose_key(ctx, endpoint, policy);

        // Serialize the get→apply→set sequence per key within this process;
        // the versioned set covers writers in other processes.
        let _guard = self.lock_shard(&key).lock().await;

        for _ in 0..MAX_SET_ATTEMPTS {
            let now_ms = self.clock.now_millis();
            let current = match self.store.get(&key).await {
                Ok(current) => current,
                Err(error) => return self.degrade(&effective, now_ms, &error),
            };

            let record = current.as_ref().map(|(record, _)| record);
            let outcome = strategy.apply(record, &effective, now_ms);
            let prev_version = current.as_ref().map(|(_, version)| *version);
            let ttl = record_ttl(&outcome, &effective, now_ms);

            match self
                .store
                .set(&key, outcome.record.clone(), ttl, prev_version)
                .await
            {
                Ok(true) => {
                    if !outcome.allowed {
                        fire_on_limit(policy, ctx, &outcome.record);
                    }
                    debug!(
                        key = %key,
                        allowed = outcome.allowed,
                        remaining = outcome.remaining,
                        "admission decision"
                    );
                    return Decision::from_outcome(&outcome, effective.max);
                }
                // Lost a write race with another process; reread and retry.
                Ok(false) => continue,
                Err(error) => return self.degrade(&effective, now_ms, &error),
            }
        }

        let now_ms = self.clock.now_millis();
        self.degrade(
            &effective,
            now_ms,
            &StoreError::Unavailable("write contention retries exhausted".to_string()),
        )
    }

    /// Read-only quota lookup: reports what `check` would decide without
    /// consuming anything. `None` when no record exists yet or the store is
    /// unreachable.
    pub async fn status(
        &self,
        ctx: &CallerContext,
        endpoint: &str,
        policy: &Policy,
    ) -> Option<Decision> {
        let effective = policy.resolve(ctx.tier);
        let strategy = strategy_for(policy.strategy);
        let key = self.compose_key(ctx, endpoint, policy);

        let current = match self.store.get(&key).await {
            Ok(current) => current,
            Err(error) => {
                warn!(key = %key, %error, "status lookup failed");
                return None;
            }
        };

        let (record, _) = current?;
        let outcome = strategy.peek(Some(&record), &effective, self.clock.now_millis());
        Some(Decision::from_outcome(&outcome, effective.max))
    }

    /// Delete one caller's record for an endpoint, e.g. a support override
    /// unblocking a user.
    pub async fn clear(&self, ctx: &CallerContext, endpoint: &str) -> Result<(), StoreError> {
        let ident = identify(ctx);
        let key = self.full_key(&ident, endpoint);
        self.store.delete(&key).await
    }

    /// Flush every record. Emergency resets and tests.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    /// Diagnostic snapshot of all live records.
    pub async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError> {
        self.store.entries().await
    }

    fn compose_key(&self, ctx: &CallerContext, endpoint: &str, policy: &Policy) -> String {
        let ident = match &policy.key_fn {
            Some(key_fn) => key_fn(ctx),
            None => identify(ctx),
        };
        self.full_key(&ident, endpoint)
    }

    fn full_key(&self, ident: &str, endpoint: &str) -> String {
        format!(
            "{}{KEY_SEPARATOR}{ident}{KEY_SEPARATOR}{endpoint}",
            self.namespace
        )
    }

    fn lock_shard(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    fn degrade(&self, effective: &EffectivePolicy, now_ms: u64, error: &StoreError) -> Decision {
        let reset_at_ms = now_ms + effective.window.as_millis() as u64;
        match self.failure_mode {
            FailureMode::Open => {
                warn!(%error, "record store degraded; admitting without quota enforcement");
                Decision {
                    allowed: true,
                    limit: effective.max,
                    remaining: effective.max,
                    reset_at_ms,
                    retry_after: None,
                }
            }
            FailureMode::Closed => {
                warn!(%error, "record store degraded; rejecting (fail-closed)");
                Decision {
                    allowed: false,
                    limit: effective.max,
                    remaining: 0,
                    reset_at_ms,
                    retry_after: Some(effective.window),
                }
            }
        }
    }
}

fn strategy_for(kind: StrategyKind) -> &'static dyn Strategy {
    match kind {
        StrategyKind::FixedWindow => &FixedWindow,
        StrategyKind::SlidingWindow => &SlidingWindow,
        StrategyKind::TokenBucket => &TokenBucket,
    }
}

/// Records stay relevant for roughly one window beyond their reset, then
/// self-expire from the store.
fn record_ttl(outcome: &Outcome, effective: &EffectivePolicy, now_ms: u64) -> Duration {
    let until_reset = Duration::from_millis(outcome.reset_at_ms.saturating_sub(now_ms));
    until_reset + effective.window
}

/// The audit callback must never corrupt a decision that is already
/// computed, so panics inside it are contained here.
fn fire_on_limit(policy: &Policy, ctx: &CallerContext, record: &RateLimitRecord) {
    if let Some(on_limit) = &policy.on_limit
        && catch_unwind(AssertUnwindSafe(|| on_limit(ctx, record))).is_err()
    {
        warn!("on_limit callback panicked; decision unaffected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory_store::MemoryStore;
    use crate::policy::Tier;
    use async_trait::async_trait;
    use more_asserts::assert_gt;
    use more_asserts::assert_le;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    const EPOCH_MS: u64 = 1_700_000_000_000;

    fn limiter_at(clock: Arc<ManualClock>) -> RateLimiter<MemoryStore> {
        let store = MemoryStore::with_config(10_000, 16, Arc::clone(&clock) as Arc<dyn Clock>);
        RateLimiter::with_clock(store, clock)
    }

    #[tokio::test]
    async fn window_correctness() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::fixed_window(3, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("alice");

        let mut decisions = Vec::new();
        for _ in 0..4 {
            decisions.push(limiter.check(&ctx, "/api/items", &policy).await);
        }

        let allowed: Vec<_> = decisions.iter().map(|d| d.allowed).collect();
        assert_eq!(allowed, vec![true, true, true, false]);

        let retry = decisions[3].retry_after.unwrap();
        assert_gt!(retry, Duration::ZERO);
        assert_le!(retry, Duration::from_secs(60));
    }

    #[test]
    fn record_ttl_reaches_one_window_past_reset() {
        let policy = Policy::fixed_window(3, Duration::from_secs(60)).unwrap();
        let effective = policy.resolve(Tier::Free);
        let record = RateLimitRecord::window(EPOCH_MS, effective.window);

        let now_ms = EPOCH_MS + 10_000;
        let outcome = FixedWindow.apply(Some(&record), &effective, now_ms);
        let ttl = record_ttl(&outcome, &effective, now_ms);

        assert_eq!(ttl, Duration::from_secs(50 + 60));
        assert!(!ttl.is_zero());
    }

    #[tokio::test]
    async fn reset_correctness() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(Arc::clone(&clock));
        let policy = Policy::fixed_window(2, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("bob");

        for _ in 0..3 {
            limiter.check(&ctx, "/api/items", &policy).await;
        }

        clock.advance(Duration::from_secs(61));
        let after = limiter.check(&ctx, "/api/items", &policy).await;
        assert!(after.allowed);
        // Restarted at 1, not continuing from the prior window.
        assert_eq!(after.remaining, 1);
    }

    #[tokio::test]
    async fn status_is_idempotent() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::fixed_window(5, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("carol");

        assert!(limiter.status(&ctx, "/api/items", &policy).await.is_none());

        limiter.check(&ctx, "/api/items", &policy).await;

        for _ in 0..10 {
            let status = limiter.status(&ctx, "/api/items", &policy).await.unwrap();
            assert_eq!(status.remaining, 4);
        }

        let second = limiter.check(&ctx, "/api/items", &policy).await;
        assert_eq!(second.remaining, 3);
    }

    #[tokio::test]
    async fn tier_scales_the_admitted_count() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::fixed_window(2, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("dave").with_tier(Tier::Pro);

        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.check(&ctx, "/api/items", &policy).await.allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 4);
    }

    #[tokio::test]
    async fn endpoints_and_callers_are_isolated() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::fixed_window(1, Duration::from_secs(60)).unwrap();

        let alice = CallerContext::for_user("alice");
        let bob = CallerContext::for_user("bob");

        assert!(limiter.check(&alice, "/api/a", &policy).await.allowed);
        assert!(!limiter.check(&alice, "/api/a", &policy).await.allowed);
        // A different endpoint and a different caller both have full quota.
        assert!(limiter.check(&alice, "/api/b", &policy).await.allowed);
        assert!(limiter.check(&bob, "/api/a", &policy).await.allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_checks_admit_exactly_max() {
        let capacity = 50u32;
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = Arc::new(limiter_at(clock));
        let policy = Policy::fixed_window(capacity, Duration::from_secs(60)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..capacity + 25 {
            let limiter = Arc::clone(&limiter);
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                let ctx = CallerContext::for_user("shared");
                limiter.check(&ctx, "/api/items", &policy).await.allowed
            }));
        }

        let results = futures::future::join_all(handles).await;
        let admitted = results
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(admitted, capacity as usize);
    }

    #[tokio::test]
    async fn clear_unblocks_a_denied_caller() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::fixed_window(1, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("eve");

        assert!(limiter.check(&ctx, "/api/items", &policy).await.allowed);
        assert!(!limiter.check(&ctx, "/api/items", &policy).await.allowed);

        limiter.clear(&ctx, "/api/items").await.unwrap();
        assert!(limiter.check(&ctx, "/api/items", &policy).await.allowed);
    }

    #[tokio::test]
    async fn clear_all_flushes_every_record() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::fixed_window(1, Duration::from_secs(60)).unwrap();

        for user in ["a", "b", "c"] {
            let ctx = CallerContext::for_user(user);
            limiter.check(&ctx, "/api/items", &policy).await;
        }
        assert_eq!(limiter.entries().await.unwrap().len(), 3);

        limiter.clear_all().await.unwrap();
        assert!(limiter.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn custom_key_fn_overrides_identity() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);
        let policy = Policy::builder(StrategyKind::FixedWindow, 1, Duration::from_secs(60))
            .key_fn(|_ctx| "everyone".to_string())
            .build()
            .unwrap();

        // Two distinct users share one bucket under the custom key.
        let alice = CallerContext::for_user("alice");
        let bob = CallerContext::for_user("bob");
        assert!(limiter.check(&alice, "/api/items", &policy).await.allowed);
        assert!(!limiter.check(&bob, "/api/items", &policy).await.allowed);
    }

    #[tokio::test]
    async fn on_limit_fires_on_denial_and_panics_are_contained() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(clock);

        let fired = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&fired);
        let policy = Policy::builder(StrategyKind::FixedWindow, 1, Duration::from_secs(60))
            .on_limit_reached(move |_ctx, record| {
                seen.fetch_add(record.count, Ordering::SeqCst);
                panic!("audit sink exploded");
            })
            .build()
            .unwrap();
        let ctx = CallerContext::for_user("frank");

        assert!(limiter.check(&ctx, "/api/items", &policy).await.allowed);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let denied = limiter.check(&ctx, "/api/items", &policy).await;
        assert!(!denied.allowed);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(60)));
    }

    #[derive(Debug)]
    struct UnreachableStore;

    #[async_trait]
    impl RecordStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<(RateLimitRecord, u64)>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn set(
            &self,
            _key: &str,
            _record: RateLimitRecord,
            _ttl: Duration,
            _prev_version: Option<u64>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn clear(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn unreachable_store_fails_open_by_default() {
        let limiter = RateLimiter::new(UnreachableStore);
        let policy = Policy::fixed_window(3, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("grace");

        let decision = limiter.check(&ctx, "/api/items", &policy).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 3);

        // status degrades to absent rather than erroring.
        assert!(limiter.status(&ctx, "/api/items", &policy).await.is_none());
    }

    #[tokio::test]
    async fn unreachable_store_can_fail_closed() {
        let limiter = RateLimiter::new(UnreachableStore).failure_mode(FailureMode::Closed);
        let policy = Policy::fixed_window(3, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("heidi");

        let decision = limiter.check(&ctx, "/api/items", &policy).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Some(Duration::from_secs(60)));
    }

    /// Store whose conditional writes always report a lost race, modelling
    /// relentless cross-process contention.
    #[derive(Debug, Default)]
    struct ContendedStore;

    #[async_trait]
    impl RecordStore for ContendedStore {
        async fn get(&self, _key: &str) -> Result<Option<(RateLimitRecord, u64)>, StoreError> {
            Ok(None)
        }

        async fn set(
            &self,
            _key: &str,
            _record: RateLimitRecord,
            _ttl: Duration,
            _prev_version: Option<u64>,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn clear(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn exhausted_write_retries_degrade_like_an_outage() {
        let limiter = RateLimiter::new(ContendedStore);
        let policy = Policy::fixed_window(3, Duration::from_secs(60)).unwrap();
        let ctx = CallerContext::for_user("ivan");

        let decision = limiter.check(&ctx, "/api/items", &policy).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn token_bucket_policy_round_trips_through_the_store() {
        let clock = Arc::new(ManualClock::new(EPOCH_MS));
        let limiter = limiter_at(Arc::clone(&clock));
        let policy = Policy::builder(StrategyKind::TokenBucket, 5, Duration::from_secs(5))
            .bucket_capacity(5.0)
            .refill_rate(1.0)
            .build()
            .unwrap();
        let ctx = CallerContext::for_user("judy");

        for _ in 0..5 {
            assert!(limiter.check(&ctx, "/api/gen", &policy).await.allowed);
        }
        assert!(!limiter.check(&ctx, "/api/gen", &policy).await.allowed);

        clock.advance(Duration::from_secs(5));
        let refilled = limiter.status(&ctx, "/api/gen", &policy).await.unwrap();
        assert_eq!(refilled.remaining, 5);
    }
}
