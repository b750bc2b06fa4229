//! Thin, command-level facade over the Redis transport.
//!
//! Built around a cloneable `ConnectionManager` (internally
//! reference-counted, so cloning it per call is cheap) plus
//! `#[instrument]`ed methods covering the full command surface a
//! two-tier cache needs: conditional `SET`, `SCAN`, pub/sub, server info.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::{debug, instrument};

use crate::config::{CommandFlags, SetCondition};
use crate::error::{CacheError, CacheResult};

/// A narrow, command-level wrapper around a shared Redis connection.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    conn: ConnectionManager,
    async_timeout: Duration,
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient").finish_non_exhaustive()
    }
}

impl RedisClient {
    /// Connect to `redis_url`, retrying the initial connect up to
    /// `connect_retry` times with `connection_timeout` per attempt.
    pub async fn connect(
        redis_url: &str,
        connect_retry: u32,
        connection_timeout: Duration,
        async_timeout: Duration,
    ) -> CacheResult<Self> {
        let client = Client::open(redis_url)?;

        let mut last_err = None;
        for attempt in 1..=connect_retry.max(1) {
            match tokio::time::timeout(connection_timeout, ConnectionManager::new(client.clone()))
                .await
            {
                Ok(Ok(conn)) => {
                    return Ok(Self {
                        client,
                        conn,
                        async_timeout,
                    });
                }
                Ok(Err(e)) => {
                    debug!(attempt, error = %e, "redis connect attempt failed");
                    last_err = Some(CacheError::from(e));
                }
                Err(_) => {
                    debug!(attempt, "redis connect attempt timed out");
                    last_err = Some(CacheError::Timeout(connection_timeout));
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }

    /// Race `fut` against `self.async_timeout`, surfacing an expired
    /// timeout as [`CacheError::Timeout`] rather than letting the
    /// caller hang on a wedged connection.
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        match tokio::time::timeout(self.async_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.async_timeout)),
        }
    }

    /// The underlying `redis::Client`, used by the invalidation bus to
    /// open a dedicated pub/sub connection (`ConnectionManager` does
    /// not support pub/sub).
    pub fn raw_client(&self) -> Client {
        self.client.clone()
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// A cloned handle to the shared connection, for callers (the lock
    /// manager) that need to `invoke_async` a [`redis::Script`] directly.
    pub(crate) fn connection_manager(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// `SET key value [EX ttl] [NX|XX] [KEEPTTL]`.
    ///
    /// Returns `true` iff the write took effect (a conditional write
    /// that did not match returns `false`, not an error).
    #[instrument(skip(self, value), fields(cache.operation = "SET"))]
    pub async fn string_set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
        condition: SetCondition,
        keep_ttl: bool,
        flags: CommandFlags,
    ) -> CacheResult<bool> {
        if flags.prefer_replica || flags.demand_master {
            debug!(
                prefer_replica = flags.prefer_replica,
                demand_master = flags.demand_master,
                "routing hint ignored: single-connection ConnectionManager has no replica topology to route across"
            );
        }

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);

        match condition {
            SetCondition::Always => {}
            SetCondition::IfNotExists => {
                cmd.arg("NX");
            }
            SetCondition::IfExists => {
                cmd.arg("XX");
            }
        }

        if keep_ttl {
            cmd.arg("KEEPTTL");
        } else if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }

        let mut conn = self.conn();
        if flags.fire_and_forget {
            tokio::spawn(async move {
                let _: CacheResult<redis::Value> =
                    cmd.query_async(&mut conn).await.map_err(CacheError::from);
            });
            return Ok(true);
        }

        self.with_timeout(async move {
            let reply: redis::Value = cmd.query_async(&mut conn).await?;
            Ok(!matches!(reply, redis::Value::Nil))
        })
        .await
    }

    /// `GET key`.
    #[instrument(skip(self), fields(cache.operation = "GET"))]
    pub async fn string_get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let value: Option<Vec<u8>> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    /// `DEL key [key ...]`, returning the number of keys removed.
    #[instrument(skip(self, keys), fields(cache.operation = "DEL"))]
    pub async fn key_delete(&self, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        self.with_timeout(async move {
            let count: u64 = conn.del(keys).await?;
            Ok(count)
        })
        .await
    }

    /// Dispatch `UNLINK key [key ...]` without awaiting the reply,
    /// returning the number of keys dispatched rather than acknowledged.
    #[instrument(skip(self, keys), fields(cache.operation = "UNLINK"))]
    pub fn key_delete_fire_and_forget(&self, keys: Vec<String>) -> u64 {
        let dispatched = keys.len() as u64;
        if keys.is_empty() {
            return 0;
        }
        let mut conn = self.conn();
        tokio::spawn(async move {
            let _: CacheResult<u64> = conn.unlink(&keys).await.map_err(CacheError::from);
        });
        dispatched
    }

    /// Remaining TTL for `key`, or `None` if it has no expiry / does
    /// not exist.
    #[instrument(skip(self), fields(cache.operation = "TTL"))]
    pub async fn key_expire_time(&self, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let ttl: i64 = conn.ttl(key).await?;
            Ok(if ttl > 0 {
                Some(Duration::from_secs(ttl as u64))
            } else {
                None
            })
        })
        .await
    }

    /// `EXISTS key`.
    #[instrument(skip(self), fields(cache.operation = "EXISTS"))]
    pub async fn key_exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn();
        self.with_timeout(async move { Ok(conn.exists(key).await?) })
            .await
    }

    /// One page of a cursor-based `SCAN key MATCH pattern COUNT count`.
    #[instrument(skip(self), fields(cache.operation = "SCAN"))]
    pub async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: u64,
    ) -> CacheResult<(u64, Vec<String>)> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok((next_cursor, keys))
        })
        .await
    }

    /// `PUBLISH channel message`, returning the receiver count.
    #[instrument(skip(self, message), fields(cache.operation = "PUBLISH"))]
    pub async fn publish(&self, channel: &str, message: Vec<u8>) -> CacheResult<i64> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let receivers: i64 = conn.publish(channel, message).await?;
            Ok(receivers)
        })
        .await
    }

    /// `TIME`, returning (seconds, microseconds) as reported by the server.
    pub async fn time(&self) -> CacheResult<(i64, i64)> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let reply: (i64, i64) = redis::cmd("TIME").query_async(&mut conn).await?;
            Ok(reply)
        })
        .await
    }

    /// `DBSIZE`. Gated on `AllowAdmin` by the orchestrator, not here.
    pub async fn dbsize(&self) -> CacheResult<i64> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let size: i64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
            Ok(size)
        })
        .await
    }

    /// `PING`, returning round-trip latency.
    pub async fn ping(&self) -> CacheResult<Duration> {
        let mut conn = self.conn();
        let started = std::time::Instant::now();
        self.with_timeout(async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await?;
        Ok(started.elapsed())
    }

    /// `ECHO message`.
    pub async fn echo(&self, message: &str) -> CacheResult<String> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let reply: String = redis::cmd("ECHO").arg(message).query_async(&mut conn).await?;
            Ok(reply)
        })
        .await
    }

    /// `INFO server`, extracting the `redis_version` field.
    pub async fn server_version(&self) -> CacheResult<String> {
        let mut conn = self.conn();
        let info: String = self
            .with_timeout(async move {
                let info: String = redis::cmd("INFO")
                    .arg("server")
                    .query_async(&mut conn)
                    .await?;
                Ok(info)
            })
            .await?;
        info.lines()
            .find_map(|line| line.strip_prefix("redis_version:"))
            .map(|v| v.trim().to_string())
            .ok_or_else(|| CacheError::Protocol("INFO server reply missing redis_version".into()))
    }

    /// `FLUSHDB`. Gated on `AllowAdmin` by the orchestrator, not here.
    pub async fn flush_db(&self) -> CacheResult<()> {
        let mut conn = self.conn();
        self.with_timeout(async move {
            let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
