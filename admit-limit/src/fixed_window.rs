use std::time::Duration;

use crate::Outcome;
use crate::RateLimitRecord;
use crate::Strategy;
use crate::policy::EffectivePolicy;

/// A simple window-based strategy.
///
/// Divides time into fixed intervals anchored at the first request of each
/// window. It is the cheapest strategy but admits up to twice the limit
/// across a window seam (a burst at the end of one window followed by a
/// burst at the start of the next). That is an accepted, documented
/// characteristic, not a bug.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedWindow;

impl FixedWindow {
    /// Current-window view of `record`: a stale record is replaced by a
    /// fresh window, never incrementally patched.
    fn refresh(
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> RateLimitRecord {
        match record {
            Some(existing) if now_ms < existing.reset_at_ms => existing.clone(),
            _ => RateLimitRecord::window(now_ms, policy.window),
        }
    }
}

impl Strategy for FixedWindow {
    fn apply(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome {
        let mut record = Self::refresh(record, policy, now_ms);

        // Boundary is inclusive of the limit, exclusive once reached.
        let allowed = record.count < policy.max;
        if allowed {
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

    fn peek(
        &self,
        record: Option<&RateLimitRecord>,
        policy: &EffectivePolicy,
        now_ms: u64,
    ) -> Outcome {
        let record = Self::refresh(record, policy, now_ms);
        let allowed = record.count < policy.max;
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
