use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::RateLimitRecord;
use crate::identity::CallerContext;

/// Custom key derivation, overriding the default identity chain.
pub type KeyFn = Arc<dyn Fn(&CallerContext) -> String + Send + Sync>;

/// Callback invoked when a request is denied, for audit logging.
pub type OnLimitFn = Arc<dyn Fn(&CallerContext, &RateLimitRecord) + Send + Sync>;

/// Which admission algorithm a policy uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Counter reset every fixed interval. Fastest, but admits up to twice
    /// the limit across a window seam.
    FixedWindow,
    /// O(1) rolling-window approximation of a sliding window.
    SlidingWindow,
    /// Capacity accrues continuously at a refill rate.
    TokenBucket,
}

/// Subscription tier, used to scale a base policy's limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Creator,
    Lifetime,
}

impl Tier {
    /// Multiplier applied to a base policy's `max`.
    pub fn multiplier(self) -> u32 {
        match self {
            Tier::Free => 1,
            Tier::Pro => 2,
            Tier::Creator => 5,
            Tier::Lifetime => 10,
        }
    }
}

/// Rejected policy configuration. Surfaces when the policy is built, never
/// per request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max must be greater than zero")]
    ZeroMax,

    #[error("window duration must be greater than zero")]
    ZeroWindow,

    #[error("refill rate must be positive, got {0}")]
    NonPositiveRefillRate(f64),

    #[error("bucket capacity must be positive, got {0}")]
    NonPositiveCapacity(f64),

    #[error("cost per request must be greater than zero")]
    ZeroCost,
}

/// Immutable admission configuration for one call site.
///
/// Built through [`PolicyBuilder`] so malformed values are a setup-time
/// error. Cheap to clone: the optional callbacks are shared via `Arc`.
#[derive(Clone)]
pub struct Policy {
    pub(crate) strategy: StrategyKind,
    pub(crate) max: u32,
    pub(crate) window: Duration,
    pub(crate) refill_rate: Option<f64>,
    pub(crate) bucket_capacity: Option<f64>,
    pub(crate) cost: u32,
    pub(crate) key_fn: Option<KeyFn>,
    pub(crate) on_limit: Option<OnLimitFn>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("strategy", &self.strategy)
            .field("max", &self.max)
            .field("window", &self.window)
            .field("refill_rate", &self.refill_rate)
            .field("bucket_capacity", &self.bucket_capacity)
            .field("cost", &self.cost)
            .field("key_fn", &self.key_fn.as_ref().map(|_| ".."))
            .field("on_limit", &self.on_limit.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Policy {
    /// Start building a policy.
    pub fn builder(strategy: StrategyKind, max: u32, window: Duration) -> PolicyBuilder {
        PolicyBuilder {
            strategy,
            max,
            window,
            refill_rate: None,
            bucket_capacity: None,
            cost: 1,
            key_fn: None,
            on_limit: None,
        }
    }

    /// A fixed-window policy admitting `max` requests per `window`.
    pub fn fixed_window(max: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::builder(StrategyKind::FixedWindow, max, window).build()
    }

    /// A sliding-window policy admitting `max` requests per rolling `window`.
    pub fn sliding_window(max: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::builder(StrategyKind::SlidingWindow, max, window).build()
    }

    /// A token-bucket policy. Without explicit tuning the refill rate and
    /// capacity default to `max / window` and `max`, making it a drop-in
    /// replacement for a fixed window with smoother admission.
    pub fn token_bucket(max: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::builder(StrategyKind::TokenBucket, max, window).build()
    }

    /// Strict preset for expensive generation endpoints: 10 requests per
    /// minute, token bucket so short bursts drain smoothly.
    pub fn strict() -> Self {
        Self::builder(StrategyKind::TokenBucket, 10, Duration::from_secs(60))
            .build()
            .expect("preset parameters are valid")
    }

    /// Relaxed preset for general reads: 100 requests per minute.
    pub fn relaxed() -> Self {
        Self::builder(StrategyKind::SlidingWindow, 100, Duration::from_secs(60))
            .build()
            .expect("preset parameters are valid")
    }

    /// Extended-window preset for authentication endpoints: 5 attempts per
    /// 15 minutes.
    pub fn auth() -> Self {
        Self::builder(StrategyKind::FixedWindow, 5, Duration::from_secs(900))
            .build()
            .expect("preset parameters are valid")
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Scale this policy by a subscription tier.
    ///
    /// A pure transform: `max` is multiplied by the tier multiplier and the
    /// token-bucket defaults are derived from the scaled value; everything
    /// else passes through untouched. The result is never persisted.
    pub fn resolve(&self, tier: Tier) -> EffectivePolicy {
        let max = self.max.saturating_mul(tier.multiplier());
        let window_secs = self.window.as_secs_f64();
        EffectivePolicy {
            strategy: self.strategy,
            max,
            window: self.window,
            refill_rate: self.refill_rate.unwrap_or(f64::from(max) / window_secs),
            capacity: self.bucket_capacity.unwrap_or(f64::from(max)),
            cost: self.cost,
        }
    }
}

/// Builder for [`Policy`]. `build` rejects malformed configuration.
pub struct PolicyBuilder {
    strategy: StrategyKind,
    max: u32,
    window: Duration,
    refill_rate: Option<f64>,
    bucket_capacity: Option<f64>,
    cost: u32,
    key_fn: Option<KeyFn>,
    on_limit: Option<OnLimitFn>,
}

impl PolicyBuilder {
    /// Tokens added per second (token-bucket strategies only).
    pub fn refill_rate(mut self, per_second: f64) -> Self {
        self.refill_rate = Some(per_second);
        self
    }

    /// Maximum tokens the bucket holds.
    pub fn bucket_capacity(mut self, capacity: f64) -> Self {
        self.bucket_capacity = Some(capacity);
        self
    }

    /// Quota consumed per admitted request. Defaults to 1.
    pub fn cost_per_request(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Override the default caller-identity key derivation.
    pub fn key_fn(mut self, f: impl Fn(&CallerContext) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Some(Arc::new(f));
        self
    }

    /// Audit callback invoked when a request is denied. Panics inside the
    /// callback are isolated and cannot alter the decision.
    pub fn on_limit_reached(
        mut self,
        f: impl Fn(&CallerContext, &RateLimitRecord) + Send + Sync + 'static,
    ) -> Self {
        self.on_limit = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Policy, ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::ZeroMax);
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroWindow);
        }
        if let Some(rate) = self.refill_rate
            && rate <= 0.0
        {
            return Err(ConfigError::NonPositiveRefillRate(rate));
        }
        if let Some(capacity) = self.bucket_capacity
            && capacity <= 0.0
        {
            return Err(ConfigError::NonPositiveCapacity(capacity));
        }
        if self.cost == 0 {
            return Err(ConfigError::ZeroCost);
        }
        Ok(Policy {
            strategy: self.strategy,
            max: self.max,
            window: self.window,
            refill_rate: self.refill_rate,
            bucket_capacity: self.bucket_capacity,
            cost: self.cost,
            key_fn: self.key_fn,
            on_limit: self.on_limit,
        })
    }
}

/// A [`Policy`] after tier scaling, flattened into the concrete numbers the
/// strategies consume. Derived on every check, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub strategy: StrategyKind,
    pub max: u32,
    pub window: Duration,
    /// Tokens per second.
    pub refill_rate: f64,
    pub capacity: f64,
    pub cost: u32,
}
