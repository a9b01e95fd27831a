use std::time::Duration;

use async_trait::async_trait;

use crate::RateLimitRecord;

/// Failures from a record store backend.
///
/// An unreachable backend is an explicit error, never a silent "absent":
/// the limiter facade decides whether an outage fails open or closed, and it
/// can only do that if it can tell an outage from a missing record.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached (includes timed-out calls).
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be round-tripped.
    #[error("record serialization failed: {0}")]
    Serialization(String),
}

/// Key→record storage with per-entry expiry.
///
/// Writes are versioned: `set` only succeeds when the caller's view of the
/// entry is still current, which lets the facade run an optimistic
/// read-compute-write loop instead of holding a lock across backend I/O.
/// Within one process the facade additionally serializes checks per key, so
/// version conflicts only arise between processes sharing a remote store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the record and its write version, or `None` if absent/expired.
    async fn get(&self, key: &str) -> Result<Option<(RateLimitRecord, u64)>, StoreError>;

    /// Conditionally write `record` with the given time-to-live.
    ///
    /// `prev_version` is the version returned by the preceding `get`
    /// (`None` when the entry was absent: create only if still absent).
    /// Returns `Ok(false)` when another writer got there first.
    async fn set(
        &self,
        key: &str,
        record: RateLimitRecord,
        ttl: Duration,
        prev_version: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// Drop one entry.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop every entry.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Snapshot of all live entries, for diagnostics and operator tooling.
    async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError>;
}
