use crate::policy::Tier;

/// Separator used when composing store keys. A control character so no
/// identity source (user id, IP address, endpoint path) can collide two
/// distinct keys into one.
pub(crate) const KEY_SEPARATOR: char = '\u{1f}';

/// The caller-facing slice of a request, as supplied by the surrounding HTTP
/// and auth layers.
///
/// The limiter never sees the request object itself; the caller extracts
/// these fields and hands them over.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    /// Authenticated caller id, if the upstream auth layer attached one.
    pub user_id: Option<String>,
    /// Forwarded-address chain (e.g. parsed from a forwarding header),
    /// closest-to-client first.
    pub forwarded_for: Vec<String>,
    /// Direct network peer address.
    pub peer_addr: Option<String>,
    /// Subscription tier used to scale policy limits.
    pub tier: Tier,
}

impl CallerContext {
    /// Context for an authenticated caller.
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    /// Context for an anonymous caller known only by address.
    pub fn for_addr(peer_addr: impl Into<String>) -> Self {
        Self {
            peer_addr: Some(peer_addr.into()),
            ..Self::default()
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

/// Derive a stable identity string for a caller.
///
/// Precedence: authenticated user id, then the first forwarded address, then
/// the direct peer address, then a shared `"unknown"` bucket. Identity-based
/// limiting survives NAT and device churn better than address-based
/// limiting, but addresses remain the necessary fallback for anonymous
/// endpoints.
pub fn identify(ctx: &CallerContext) -> String {
    if let Some(user_id) = &ctx.user_id {
        return format!("user:{user_id}");
    }
    if let Some(forwarded) = ctx.forwarded_for.first() {
        let trimmed = forwarded.trim();
        if !trimmed.is_empty() {
            return format!("ip:{trimmed}");
        }
    }
    if let Some(peer) = &ctx.peer_addr {
        return format!("ip:{peer}");
    }
    "unknown".to_string()
}
