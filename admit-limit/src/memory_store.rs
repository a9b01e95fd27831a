use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::RateLimitRecord;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::store::RecordStore;
use crate::store::StoreError;

/// Default maximum entry count for the primary store.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    record: RateLimitRecord,
    version: u64,
    expires_at_ms: u64,
}

/// In-process record store: a sharded, bounded LRU with per-entry TTL.
///
/// Each shard holds `max_entries / shards` records; inserting into a full
/// shard evicts its least-recently-used entry. Reads refresh recency.
/// Expiry is checked lazily on access and opportunistically when an insert
/// lands on a full shard.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Box<[Mutex<LruCache<String, Entry>>]>,
    clock: Arc<dyn Clock>,
    versions: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store bounded to [`DEFAULT_MAX_ENTRIES`] records on the system
    /// clock.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_ENTRIES, DEFAULT_SHARDS, Arc::new(SystemClock))
    }

    /// A store bounded to `max_entries` records.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self::with_config(max_entries, DEFAULT_SHARDS, Arc::new(SystemClock))
    }

    /// Full control over bound, shard count, and clock. A single shard makes
    /// eviction order globally LRU, at the price of lock contention.
    pub fn with_config(max_entries: usize, shards: usize, clock: Arc<dyn Clock>) -> Self {
        let shards = shards.max(1);
        let per_shard = NonZeroUsize::new(max_entries.div_ceil(shards).max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shards)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            clock,
            versions: AtomicU64::new(1),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<(RateLimitRecord, u64)>, StoreError> {
        let now_ms = self.clock.now_millis();
        let mut shard = self.shard(key).lock();
        match shard.get(key) {
            Some(entry) if entry.expires_at_ms > now_ms => {
                Ok(Some((entry.record.clone(), entry.version)))
            }
            Some(_) => {
                shard.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        record: RateLimitRecord,
        ttl: Duration,
        prev_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let now_ms = self.clock.now_millis();
        let version = self.next_version();
        let mut shard = self.shard(key).lock();

        let current = shard
            .peek(key)
            .filter(|entry| entry.expires_at_ms > now_ms)
            .map(|entry| entry.version);
        if current != prev_version {
            return Ok(false);
        }

        // Insertion pressure: drop expired entries before LRU eviction kicks
        // in, so a full shard sheds dead weight first.
        if shard.len() == shard.cap().get() && !shard.contains(key) {
            let expired: Vec<String> = shard
                .iter()
                .filter(|(_, entry)| entry.expires_at_ms <= now_ms)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                shard.pop(&k);
            }
        }

        shard.put(
            key.to_string(),
            Entry {
                record,
                version,
                expires_at_ms: now_ms + ttl.as_millis() as u64,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.shard(key).lock().pop(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for shard in &self.shards {
            shard.lock().clear();
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError> {
        let now_ms = self.clock.now_millis();
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (key, entry) in shard.iter() {
                if entry.expires_at_ms > now_ms {
                    out.push((key.clone(), entry.record.clone()));
                }
            }
        }
        Ok(out)
    }
}
