//! # admit-limit
//!
//! `admit-limit` is a pluggable request admission-control library: for every
//! incoming request it decides whether to admit it, and publishes the
//! remaining quota and retry timing alongside the decision.
//!
//! ## Core Philosophy
//!
//! Admission state lives in a [`RecordStore`] keyed by caller and endpoint,
//! not inside the strategy objects. Strategies are stateless math over a
//! fetched [`RateLimitRecord`], which means the same algorithm works against
//! the in-process store and a shared Redis store without modification, and a
//! fleet of processes can enforce one quota.
//!
//! ## Key Concepts
//!
//! * **Strategy Trait**: a unified interface for the admission algorithms
//!   (fixed window, sliding window approximation, token bucket).
//! * **Versioned Store**: conditional writes let the facade retry on races
//!   instead of holding locks across backend I/O.
//! * **Fail Open**: a store outage degrades to admitting traffic (with a
//!   warning) rather than rejecting everything; configurable to fail closed
//!   for security-sensitive endpoints.
//!
//! ## Example
//!
//! ```rust
//! use admit_limit::{CallerContext, MemoryStore, Policy, RateLimiter};
//! use std::time::Duration;
//!
//! # async fn demo() {
//! let limiter = RateLimiter::new(MemoryStore::new());
//! let policy = Policy::fixed_window(100, Duration::from_secs(60)).unwrap();
//! let ctx = CallerContext::for_user("user-42");
//!
//! let decision = limiter.check(&ctx, "/api/generate", &policy).await;
//! if decision.allowed {
//!     // Request admitted
//! }
//! # }
//! ```

use std::fmt::Debug;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

mod burst;
mod clock;
mod fixed_window;
mod identity;
mod limiter;
mod memory_store;
mod policy;
#[cfg(feature = "redis-backend")]
mod redis_store;
mod sliding_window;
mod store;
mod token_bucket;

pub use burst::BurstLimiter;
pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use fixed_window::FixedWindow;
pub use identity::CallerContext;
pub use identity::identify;
pub use limiter::Decision;
pub use limiter::FailureMode;
pub use limiter::RateLimiter;
pub use memory_store::MemoryStore;
pub use policy::ConfigError;
pub use policy::EffectivePolicy;
pub use policy::Policy;
pub use policy::PolicyBuilder;
pub use policy::StrategyKind;
pub use policy::Tier;
#[cfg(feature = "redis-backend")]
pub use redis_store::RedisStore;
pub use sliding_window::SlidingWindow;
pub use store::RecordStore;
pub use store::StoreError;
pub use token_bucket::TokenBucket;

/// The mutable admission state tracked per `(caller, endpoint)` key.
///
/// Flat by design: the remote store round-trips it as a single JSON object,
/// so there are no nested references to keep cross-process compatibility
/// trivial. Window strategies use `count`/`window_start_ms`/`reset_at_ms`;
/// token buckets use `tokens`/`last_refill_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Requests admitted in the current window.
    pub count: u32,
    /// Fractional tokens remaining; fractional so sub-integer refill rates
    /// accumulate instead of truncating to zero.
    pub tokens: f64,
    /// When the current window began, milliseconds since the UNIX epoch.
    pub window_start_ms: u64,
    /// When the current window rolls over.
    pub reset_at_ms: u64,
    /// Last time bucket tokens were topped up.
    pub last_refill_ms: u64,
}

impl RateLimitRecord {
    /// A fresh window record starting at `now_ms`.
    pub fn window(now_ms: u64, window: Duration) -> Self {
        Self {
            count: 0,
            tokens: 0.0,
            window_start_ms: now_ms,
            reset_at_ms: now_ms + window.as_millis() as u64,
            last_refill_ms: now_ms,
        }
    }

    /// A fresh bucket record, full to `capacity`, last refilled at `now_ms`.
    pub fn bucket(now_ms: u64, capacity: f64) -> Self {
        Self {
            count: 0,
            tokens: capacity,
            window_start_ms: now_ms,
            reset_at_ms: now_ms,
            last_refill_ms: now_ms,
        }
    }
}

/// The result of applying a strategy to a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// The record after this check. Persisted even on denial: token buckets
    /// advance `last_refill_ms` regardless of the admission outcome so refill
    /// accounting stays accurate.
    pub record: RateLimitRecord,
    /// Whether the request was admitted.
    pub allowed: bool,
    /// Admissions left in the current window (or whole tokens left).
    pub remaining: u32,
    /// When the window rolls over (or the bucket refills completely).
    pub reset_at_ms: u64,
    /// How long a denied caller should wait before retrying.
    pub retry_after: Option<Duration>,
}

/// The core trait for all admission algorithms.
///
/// Strategies are stateless and reentrant: all state arrives via `record`
/// and leaves via [`Outcome::record`]. Serialization of concurrent checks on
/// one key is the caller's job (see [`RateLimiter`]).
pub trait Strategy: Debug + Send + Sync {
    /// Decide one request, consuming quota when admitted.
    fn apply(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome;

    /// Same math as [`apply`](Strategy::apply) but read-only: reports what
    /// the decision would be without consuming anything. Backs
    /// [`RateLimiter::status`].
    fn peek(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome;
}
