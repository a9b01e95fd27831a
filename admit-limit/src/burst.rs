use std::sync::Arc;
use std::time::Duration;

use crate::RateLimitRecord;
use crate::clock::Clock;
use crate::identity::CallerContext;
use crate::limiter::Decision;
use crate::limiter::RateLimiter;
use crate::memory_store::MemoryStore;
use crate::policy::ConfigError;
use crate::policy::Policy;
use crate::store::StoreError;

/// Default maximum entry count for the burst store. Smaller than the
/// primary store: burst records are short-lived by nature.
pub const BURST_MAX_ENTRIES: usize = 5_000;

/// A standalone short-burst allowance: an independent token bucket layered
/// in front of (or alongside) a primary policy.
///
/// Deliberately its own instance with its own store and a distinct `burst`
/// key namespace rather than state folded into the primary strategy, so the
/// two can be reasoned about and tested in isolation. Admit a request only
/// when both this and the primary limiter agree.
pub struct BurstLimiter {
    inner: RateLimiter<MemoryStore>,
    policy: Policy,
}

impl BurstLimiter {
    /// A burst bucket of `capacity` tokens replenishing over `window`.
    pub fn new(capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        let policy = Policy::token_bucket(capacity, window)?;
        Ok(Self {
            inner: RateLimiter::new(MemoryStore::with_capacity(BURST_MAX_ENTRIES))
                .namespace("burst"),
            policy,
        })
    }

    /// Same, with an injected clock for deterministic tests.
    pub fn with_clock(
        capacity: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let policy = Policy::token_bucket(capacity, window)?;
        let store =
            MemoryStore::with_config(BURST_MAX_ENTRIES, 16, Arc::clone(&clock));
        Ok(Self {
            inner: RateLimiter::with_clock(store, clock).namespace("burst"),
            policy,
        })
    }

    /// Spend one burst token for this caller and endpoint.
    pub async fn check(&self, ctx: &CallerContext, endpoint: &str) -> Decision {
        self.inner.check(ctx, endpoint, &self.policy).await
    }

    /// Read-only view of the caller's burst allowance.
    pub async fn status(&self, ctx: &CallerContext, endpoint: &str) -> Option<Decision> {
        self.inner.status(ctx, endpoint, &self.policy).await
    }

    /// Reset one caller's burst allowance.
    pub async fn clear(&self, ctx: &CallerContext, endpoint: &str) -> Result<(), StoreError> {
        self.inner.clear(ctx, endpoint).await
    }

    /// Diagnostic snapshot of live burst records.
    pub async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError> {
        self.inner.entries().await
    }
}
