use std::time::Duration;

use crate::Outcome;
use crate::RateLimitRecord;
use crate::Strategy;
use crate::policy::EffectivePolicy;

/// An O(1) sliding-window approximation.
///
/// The window rolls continuously from the first request that opened it: once
/// the full window has elapsed since `window_start_ms` the count resets,
/// otherwise the threshold is unchanged. This trades exactness for O(1)
/// memory per key; in the worst case it behaves like a fixed window,
/// including the burst-at-the-seam allowance.
///
/// If true sliding precision is ever required, the replacement is a
/// two-counter scheme (current window plus previous window weighted by
/// overlap) rather than a timestamp ledger, to keep memory bounded.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlidingWindow;

impl SlidingWindow {
    fn refresh(
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> RateLimitRecord {
        let window_ms = policy.window.as_millis() as u64;
        match record {
            Some(existing) if now_ms.saturating_sub(existing.window_start_ms) < window_ms => {
                existing.clone()
            }
            _ => RateLimitRecord::window(now_ms, policy.window),
        }
    }

    fn decide(
        record: RateLimitRecord,
        policy: &EffectivePolicy,
        now_ms: u64,
        consume: bool,
    ) -> Outcome {
        let mut record = record;
        let allowed = record.count < policy.max;
        if allowed && consume {
            record.count = record.count.saturating_add(policy.cost);
        }

        let remaining = policy.max.saturating_sub(record.count);
        let reset_at_ms = record.reset_at_ms;
        let retry_after = if allowed {
            None
        } else {
            Some(Duration::from_millis(reset_at_ms.saturating_sub(now_ms)))
        };

        Outcome {
            record,
            allowed,
            remaining,
            reset_at_ms,
            retry_after,
        }
    }
}

impl Strategy for SlidingWindow {
    fn apply(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome {
        Self::decide(Self::refresh(record, policy, now_ms), policy, now_ms, true)
    }

    fn peek(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome {
        Self::decide(Self::refresh(record, policy, now_ms), policy, now_ms, false)
    }
}
