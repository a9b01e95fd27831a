use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::MultiplexedConnection;
use serde::Deserialize;
use serde::Serialize;

use crate::RateLimitRecord;
use crate::store::RecordStore;
use crate::store::StoreError;

/// Value stored per key: the record plus the write version backing the
/// conditional set. Flat JSON so any process (or a human with `redis-cli`)
/// can read it.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct StoredEntry {
    version: u64,
    record: RateLimitRecord,
}

/// Compare-and-swap write. The version check and the SET must be one atomic
/// unit; two processes interleaving between a GET and a plain SET would both
/// admit past the limit.
///
/// KEYS[1] = entry key, ARGV[1] = expected version ("" = create if absent),
/// ARGV[2] = new JSON value, ARGV[3] = TTL in milliseconds.
const CAS_SET_SCRIPT: &str = r#"
    local cur = redis.call('GET', KEYS[1])
    if ARGV[1] == '' then
        if cur then return 0 end
    else
        if not cur then return 0 end
        local decoded = cjson.decode(cur)
        if tostring(decoded.version) ~= ARGV[1] then return 0 end
    end
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
"#;

/// Record store backed by a shared Redis instance, for multi-instance
/// deployments enforcing one quota.
///
/// Entries carry a TTL equal to the remaining relevance of the record, so
/// stale keys self-expire without a sweep process.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

impl RedisStore {
    /// Connect lazily to `url` (e.g. `redis://127.0.0.1:6379`).
    pub fn new(url: &str) -> Result<Self, StoreError> {
        Self::with_prefix(url, "admit")
    }

    /// Same, with a custom key namespace prefix.
    pub fn with_prefix(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Cursor-based SCAN so enumeration never blocks the server the way
    /// KEYS would.
    async fn scan_keys(&self, conn: &mut MultiplexedConnection) -> Result<Vec<String>, StoreError> {
        const SCAN_BATCH_SIZE: usize = 100;

        let pattern = format!("{}:*", self.prefix);
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH_SIZE)
                .query_async(conn)
                .await
                .map_err(unavailable)?;
            keys.extend(batch);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<(RateLimitRecord, u64)>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(self.full_key(key)).await.map_err(unavailable)?;
        match raw {
            Some(json) => {
                let entry: StoredEntry = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some((entry.record, entry.version)))
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
        let entry = StoredEntry {
            version: prev_version.unwrap_or(0) + 1,
            record,
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let expected = prev_version.map(|v| v.to_string()).unwrap_or_default();
        // PX takes a signed integer; clamp absurd TTLs instead of wrapping.
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);

        let mut conn = self.conn().await?;
        let written: i64 = Script::new(CAS_SET_SCRIPT)
            .key(self.full_key(key))
            .arg(expected)
            .arg(json)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(written == 1)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.full_key(key))
            .await
            .map_err(unavailable)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let keys = self.scan_keys(&mut conn).await?;
        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await.map_err(unavailable)?;
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, RateLimitRecord)>, StoreError> {
        let mut conn = self.conn().await?;
        let keys = self.scan_keys(&mut conn).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            // An entry may expire between the scan and the fetch.
            let raw: Option<String> = conn.get(&key).await.map_err(unavailable)?;
            if let Some(json) = raw {
                let entry: StoredEntry = serde_json::from_str(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let bare = key
                    .strip_prefix(&format!("{}:", self.prefix))
                    .unwrap_or(&key)
                    .to_string();
                out.push((bare, entry.record));
            }
        }
        Ok(out)
    }
}
