//! Redis-backed counter store shared by every gateway instance.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::store::{CounterStore, StoreError, StoreResult};
use super::window::SlidingWindow;

/// Increments the current slice, drops slices that left the window,
/// refreshes the key expiry and returns the window total in one round trip.
const INCREMENT_SCRIPT: &str = r"
local oldest = tonumber(ARGV[2])
redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
local fields = redis.call('HGETALL', KEYS[1])
local total = 0
for i = 1, #fields, 2 do
    if tonumber(fields[i]) < oldest then
        redis.call('HDEL', KEYS[1], fields[i])
    else
        total = total + tonumber(fields[i + 1])
    end
end
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return total
";

/// A counter store kept in Redis.
///
/// Each key is a hash with one field per window slice. Slice numbers are
/// derived from wall-clock time, so gateway hosts are expected to keep their
/// clocks in sync to within a slice.
pub struct RedisStore {
    /// Redis connection manager, reconnects on its own
    connection: ConnectionManager,
    /// Compiled increment script
    increment: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Backend(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to connect to Redis at {}: {}", url, e))
        })?;

        info!(url = %url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    fn current_bucket(window: &SlidingWindow) -> u64 {
        window.bucket_at(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }
}

/// Hash field names for every slice in the window ending at `current`.
fn slice_fields(window: &SlidingWindow, current: u64) -> Vec<String> {
    window
        .active_buckets(current)
        .map(|bucket| bucket.to_string())
        .collect()
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64> {
        let current = Self::current_bucket(window);
        let oldest = *window.active_buckets(current).start();
        let mut connection = self.connection.clone();

        let total: u64 = self
            .increment
            .key(key)
            .arg(current)
            .arg(oldest)
            .arg(window.period().as_millis() as u64)
            .invoke_async(&mut connection)
            .await?;

        debug!(key = %key, bucket = current, total = total, "Incremented Redis counter");
        Ok(total)
    }

    async fn count(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64> {
        let current = Self::current_bucket(window);
        let mut connection = self.connection.clone();

        let slices: Vec<Option<u64>> = redis::cmd("HMGET")
            .arg(key)
            .arg(slice_fields(window, current))
            .query_async(&mut connection)
            .await?;

        Ok(slices.into_iter().flatten().sum())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
