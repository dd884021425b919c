//! Redis-backed counter store.
//!
//! Create-if-absent and the increment travel in one `MULTI`/`EXEC`
//! pipeline: `SET key 0 PX <window> NX` followed by `INCRBY key 1`. The `NX`
//! guard means only the first touch in a window sets the expiry, so later
//! touches never push the window boundary out.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, RedisError};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{CounterStore, StoreError};

/// Counter store backed by a shared Redis instance.
///
/// Holds one multiplexed connection established at startup; each request
/// works on a cheap clone of it.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection_with_timeouts(response_timeout, connect_timeout)
            .await
            .map_err(map_redis_error)?;

        info!(url = %url, "Connected to Redis counter store");
        Ok(Self { conn })
    }

    async fn adjust(&self, key: &str, window: Duration, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (count,): (i64,) = ::redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(key)
            .arg(0)
            .arg("PX")
            .arg(window_millis(window))
            .arg("NX")
            .ignore()
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        debug!(key = %key, delta = delta, count = count, "Adjusted Redis counter");
        Ok(count)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        self.adjust(key, window, 1).await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(ttl_from_pttl(ttl_ms))
    }

    async fn decrement(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        self.adjust(key, window, -1).await
    }
}

/// Window length in whole milliseconds; Redis rejects a zero expiry.
fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}

/// `PTTL` answers -2 for a missing key and -1 for a key without expiry.
fn ttl_from_pttl(ttl_ms: i64) -> Option<Duration> {
    if ttl_ms > 0 {
        Some(Duration::from_millis(ttl_ms as u64))
    } else {
        None
    }
}

fn map_redis_error(err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(err.to_string())
    }
}
