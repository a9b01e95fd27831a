use std::time::Duration;

use crate::Outcome;
use crate::RateLimitRecord;
use crate::Strategy;
use crate::policy::EffectivePolicy;

/// A token-bucket strategy.
///
/// Capacity accrues continuously at `refill_rate` tokens per second, up to
/// `capacity`, and each admitted request spends `cost` tokens. A fresh key
/// starts with a full bucket. Lazy evaluation: tokens are recalculated at
/// the moment of each check, so there is no background refill task.
///
/// Refill accounting stays accurate regardless of the admission outcome:
/// a denied check still advances `last_refill_ms` after crediting the
/// elapsed time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenBucket;

impl TokenBucket {
    /// Tokens available at `now_ms`, after crediting elapsed refill.
    fn refill(
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> (f64, u64) {
        match record {
            Some(existing) => {
                let tokens = existing.tokens.clamp(0.0, policy.capacity);
                let elapsed_secs =
                    now_ms.saturating_sub(existing.last_refill_ms) as f64 / 1_000.0;
                (
                    (tokens + elapsed_secs * policy.refill_rate).min(policy.capacity),
                    existing.window_start_ms,
                )
            }
            None => (policy.capacity, now_ms),
        }
    }

    /// When the bucket is full again, used as the decision's reset marker.
    fn full_at_ms(tokens: f64, policy: &EffectivePolicy, now_ms: u64) -> u64 {
        let deficit = (policy.capacity - tokens).max(0.0);
        now_ms + (deficit / policy.refill_rate * 1_000.0).ceil() as u64
    }
}

impl Strategy for TokenBucket {
    fn apply(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome {
        let (mut tokens, window_start_ms) = Self::refill(record, policy, now_ms);
        let cost = f64::from(policy.cost);

        let allowed = tokens >= cost;
        let retry_after = if allowed {
            tokens -= cost;
            None
        } else {
            Some(Duration::from_secs_f64(
                ((cost - tokens) / policy.refill_rate).ceil(),
            ))
        };

        let reset_at_ms = Self::full_at_ms(tokens, policy, now_ms);
        let record = RateLimitRecord {
            count: 0,
            tokens,
            window_start_ms,
            reset_at_ms,
            last_refill_ms: now_ms,
        };

        Outcome {
            record,
            allowed,
            remaining: tokens.floor() as u32,
            reset_at_ms,
            retry_after,
        }
    }

    fn peek(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome {
        let (tokens, window_start_ms) = Self::refill(record, policy, now_ms);
        let cost = f64::from(policy.cost);

        let allowed = tokens >= cost;
        let retry_after = if allowed {
            None
        } else {
            Some(Duration::from_secs_f64(
                ((cost - tokens) / policy.refill_rate).ceil(),
            ))
        };

        let reset_at_ms = Self::full_at_ms(tokens, policy, now_ms);
        let record = RateLimitRecord {
            count: 0,
            tokens,
            window_start_ms,
            reset_at_ms,
            last_refill_ms: now_ms,
        };

        Outcome {
            record,
            allowed,
            remaining: tokens.floor() as u32,
            reset_at_ms,
            retry_after,
        }
    }
}
