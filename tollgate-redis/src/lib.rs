//! Redis shared store for `tollgate` (companion crate).
//! Bring your own multiplexed connection, or let [`RedisStore::connect`] open one.
//!
//! The sliding window relies on per-field hash expiry (`HPEXPIRE`/`HPTTL`), so the server must
//! run Redis 7.4 or newer.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use std::time::Duration;
use tollgate::rate_limit::{BucketSpec, SharedStore, TokenGrant};

// Theoretical-arrival-time bucket, all in microseconds of server time. Lua numbers are doubles,
// exact for epoch microseconds until well past the year 2200.
const TAKE_TOKEN: &str = r#"
local interval = tonumber(ARGV[1])
local tolerance = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000000 + tonumber(t[2])

local tat = now
local stored = redis.call('GET', KEYS[1])
if stored then
    tat = tonumber(stored)
end

local base = math.max(tat, now)
if base - now > tolerance then
    return {0, base - now - tolerance}
end

redis.call('SET', KEYS[1], string.format('%.0f', base + interval), 'PX', ttl_ms)
return {1, 0}
"#;

/// [`SharedStore`] backed by one Redis server; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    take_token: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("conn", &"<redis::aio::MultiplexedConnection>").finish()
    }
}

impl RedisStore {
    /// Wrap an existing connection.
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn, take_token: redis::Script::new(TAKE_TOKEN) }
    }

    /// Open a multiplexed connection to `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// # Errors
    /// Returns `Err` if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!(target: "tollgate::redis", "connected shared store");
        Ok(Self::new(conn))
    }
}

/// At least 1ms; Redis rejects zero expiries.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// `PTTL`/`HPTTL` replies: negative values mean "missing" or "no expiry".
fn remaining(reply: i64) -> Option<Duration> {
    u64::try_from(reply).ok().map(Duration::from_millis)
}

#[async_trait]
impl SharedStore for RedisStore {
    type Error = redis::RedisError;

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, Self::Error> {
        let mut conn = self.conn.clone();
        redis::cmd("GET").arg(key).query_async(&mut conn).await
    }

    async fn set_counter(&self, key: &str, value: u64, ttl: Duration) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        redis::cmd("SET").arg(key).arg(value).arg("PX").arg(millis(ttl)).query_async(&mut conn).await
    }

    async fn incr(&self, key: &str) -> Result<u64, Self::Error> {
        let mut conn = self.conn.clone();
        redis::cmd("INCR").arg(key).query_async(&mut conn).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(remaining(reply))
    }

    async fn field_count(&self, key: &str) -> Result<u64, Self::Error> {
        let mut conn = self.conn.clone();
        redis::cmd("HLEN").arg(key).query_async(&mut conn).await
    }

    async fn field_names(&self, key: &str) -> Result<Vec<String>, Self::Error> {
        let mut conn = self.conn.clone();
        redis::cmd("HKEYS").arg(key).query_async(&mut conn).await
    }

    async fn set_field_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<bool, Self::Error> {
        let mut conn = self.conn.clone();
        redis::cmd("HSETNX").arg(key).arg(field).arg(value).query_async(&mut conn).await
    }

    async fn expire_field(&self, key: &str, field: &str, ttl: Duration) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: Vec<i64> = redis::cmd("HPEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .arg("FIELDS")
            .arg(1)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn field_ttl(&self, key: &str, field: &str) -> Result<Option<Duration>, Self::Error> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = redis::cmd("HPTTL")
            .arg(key)
            .arg("FIELDS")
            .arg(1)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(reply.first().copied().and_then(remaining))
    }

    async fn remove_field(&self, key: &str, field: &str) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("HDEL").arg(key).arg(field).query_async(&mut conn).await?;
        Ok(())
    }

    async fn take_token(&self, key: &str, spec: BucketSpec) -> Result<TokenGrant, Self::Error> {
        let mut conn = self.conn.clone();
        let interval = micros(spec.refill_interval).max(1);
        let tolerance = interval.saturating_mul(u64::from(spec.capacity.saturating_sub(1)));
        let (allowed, wait_us): (i64, i64) = self
            .take_token
            .key(key)
            .arg(interval)
            .arg(tolerance)
            .arg(millis(spec.idle_ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(TokenGrant {
            allowed: allowed == 1,
            wait: Duration::from_micros(u64::try_from(wait_us).unwrap_or(0)),
        })
    }
}
