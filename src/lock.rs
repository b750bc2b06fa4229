//! Distributed locking.
//!
//! `SET NX PX` acquisition plus owner-checked extend/release, each made
//! atomic with a `redis::Script` Lua script. The blocking acquire loop
//! races a [`CancellationToken`] so callers can cancel a pending wait.

use std::time::Duration;

use redis::Script;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};
use crate::keys::KeyNamer;
use crate::redis_client::RedisClient;

/// `SET key owner NX PX ttl_ms` — acquire only if absent.
const LOCK_ACQUIRE: &str = r"
return redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2])
";

/// Extend the TTL only if still held by `owner`.
const LOCK_EXTEND: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";

/// Release only if still held by `owner`.
const LOCK_RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Interval between acquisition polling attempts.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Issues and manages Redis-backed distributed locks scoped to a
/// namespace.
#[derive(Clone)]
pub struct LockManager {
    redis: RedisClient,
    keys: KeyNamer,
    /// Ceiling on a single acquire/extend/release round trip — the
    /// "synchronous-shaped command sequence" `HybridCacheOptions::sync_timeout`
    /// documents itself as governing.
    sync_timeout: Duration,
}

impl LockManager {
    pub fn new(redis: RedisClient, keys: KeyNamer, sync_timeout: Duration) -> Self {
        Self {
            redis,
            keys,
            sync_timeout,
        }
    }

    async fn with_sync_timeout<T>(&self, fut: impl std::future::Future<Output = CacheResult<T>>) -> CacheResult<T> {
        match tokio::time::timeout(self.sync_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.sync_timeout)),
        }
    }

    /// Attempt to acquire the lock for `scoped_key` once, returning
    /// `None` immediately if it is already held by someone else.
    pub async fn try_lock(&self, scoped_key: &str, ttl: Duration) -> CacheResult<Option<LockGuard>> {
        reject_zero_ttl(ttl)?;
        let redis_key = self.keys.lock_key(scoped_key);
        let owner = Uuid::new_v4().to_string();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.redis.connection_manager();
        let script_key = redis_key.clone();
        let script_owner = owner.clone();
        let acquired: Option<String> = self
            .with_sync_timeout(async move {
                Ok(Script::new(LOCK_ACQUIRE)
                    .key(&script_key)
                    .arg(&script_owner)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await?)
            })
            .await?;

        Ok(acquired.map(|_| LockGuard {
            redis: self.redis.clone(),
            redis_key,
            owner,
            sync_timeout: self.sync_timeout,
        }))
    }

    /// Acquire the lock, polling every [`LOCK_POLL_INTERVAL`] (plus a
    /// few milliseconds of jitter, to keep contending waiters from
    /// retrying in lockstep) until it succeeds, `timeout` elapses, or
    /// `cancellation` fires.
    ///
    /// Returns `Ok(None)` on cancellation or timeout rather than treating
    /// either as an error — callers decide how to react to "did not
    /// acquire".
    pub async fn lock(
        &self,
        scoped_key: &str,
        ttl: Duration,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> CacheResult<Option<LockGuard>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(guard) = self.try_lock(scoped_key, ttl).await? {
                return Ok(Some(guard));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            let remaining = deadline - tokio::time::Instant::now();
            let jitter = Duration::from_millis(rand::random::<u64>() % 20);
            let sleep_for = (LOCK_POLL_INTERVAL + jitter).min(remaining);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancellation.cancelled() => return Ok(None),
            }
        }
    }
}

/// A held distributed lock.
///
/// Dropping the guard without calling [`release`](Self::release) is
/// safe: the lock expires on its own once the TTL elapses. Explicit
/// release just frees it sooner for the next waiter.
pub struct LockGuard {
    redis: RedisClient,
    redis_key: String,
    owner: String,
    sync_timeout: Duration,
}

impl LockGuard {
    async fn with_sync_timeout<T>(&self, fut: impl std::future::Future<Output = CacheResult<T>>) -> CacheResult<T> {
        match tokio::time::timeout(self.sync_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.sync_timeout)),
        }
    }

    /// Extend the lock's TTL, provided this guard is still the owner.
    ///
    /// Returns `Ok(false)` (not an error) if the lock expired or was
    /// taken over by someone else in the meantime.
    pub async fn try_extend(&self, ttl: Duration) -> CacheResult<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.redis.connection_manager();
        let redis_key = self.redis_key.clone();
        let owner = self.owner.clone();
        let extended: i64 = self
            .with_sync_timeout(async move {
                Ok(Script::new(LOCK_EXTEND)
                    .key(&redis_key)
                    .arg(&owner)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await?)
            })
            .await?;
        Ok(extended == 1)
    }

    /// Release the lock, provided this guard is still the owner.
    ///
    /// Returns `Ok(false)` if the lock had already expired or been
    /// taken over; this is a benign race, not an error condition.
    pub async fn try_release(self) -> CacheResult<bool> {
        let mut conn = self.redis.connection_manager();
        let redis_key = self.redis_key.clone();
        let owner = self.owner.clone();
        let released: i64 = self
            .with_sync_timeout(async move {
                Ok(Script::new(LOCK_RELEASE)
                    .key(&redis_key)
                    .arg(&owner)
                    .invoke_async(&mut conn)
                    .await?)
            })
            .await?;
        Ok(released == 1)
    }

    /// Check whether this guard is (still) the current holder.
    pub async fn is_held(&self) -> CacheResult<bool> {
        match self.redis.string_get(&self.redis_key).await? {
            Some(bytes) => Ok(bytes == self.owner.as_bytes()),
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("redis_key", &self.redis_key)
            .finish_non_exhaustive()
    }
}

/// Lock timeouts and TTLs are caller-supplied durations; nothing here
/// allows a zero TTL to be mistaken for "no expiry".
pub fn reject_zero_ttl(ttl: Duration) -> CacheResult<()> {
    if ttl.is_zero() {
        return Err(CacheError::Protocol("lock TTL must be non-zero".into()));
    }
    Ok(())
}
