//! The public orchestrator: composes the local tier, Redis tier,
//! invalidation bus, lock manager, and pattern engine into the cache's
//! read/write/remove/inspect/locking surface.

use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{CommandFlags, HybridCacheEntryOptions, HybridCacheOptions};
use crate::error::{CacheError, CacheResult};
use crate::expiration::resolve_local_ttl;
use crate::invalidation::InvalidationBus;
use crate::keys::KeyNamer;
use crate::local_store::LocalStore;
use crate::lock::LockGuard;
use crate::lock::LockManager;
use crate::pattern::PatternEngine;
use crate::redis_client::RedisClient;
use crate::serializer;

/// Default page size for `remove_by_pattern`'s delete batching.
const DEFAULT_BATCH_SIZE: usize = 100;

/// A hybrid two-tier cache: a bounded local tier backed by a shared
/// Redis tier, kept coherent across cooperating instances by a pub/sub
/// invalidation bus.
///
/// Constructed with [`HybridCache::new`]; call [`HybridCache::shutdown`]
/// to unsubscribe and release the background subscriber task.
pub struct HybridCache {
    options: HybridCacheOptions,
    keys: KeyNamer,
    local: LocalStore,
    redis: Option<RedisClient>,
    bus: Option<InvalidationBus>,
    locks: Option<LockManager>,
    pattern: Option<PatternEngine>,
    cancellation: CancellationToken,
    subscriber: Option<JoinHandle<()>>,
}

impl HybridCache {
    /// Construct a hybrid cache from `options`.
    ///
    /// Subscribes the invalidation bus immediately. If the initial Redis
    /// connect fails and `options.abort_on_connect_fail` is true, this
    /// returns the connect error. Otherwise construction succeeds with
    /// the instance running in a degraded, local-only mode: every
    /// Redis-touching operation logs a warning once and falls back to
    /// local-tier-only behavior.
    pub async fn new(options: HybridCacheOptions) -> CacheResult<Self> {
        let keys = KeyNamer::new(options.instances_shared_name.clone());
        let local = LocalStore::new(options.local_max_entries);
        let cancellation = CancellationToken::new();

        let connect_result = RedisClient::connect(
            &options.redis_connect_string,
            options.connect_retry,
            options.connection_timeout,
            options.async_timeout,
        )
        .await;

        let redis = match connect_result {
            Ok(client) => Some(client),
            Err(e) if options.abort_on_connect_fail => return Err(e),
            Err(e) => {
                warn!(error = %e, "initial redis connect failed, running in local-only degraded mode");
                None
            }
        };

        let (bus, locks, pattern, subscriber) = match &redis {
            Some(client) => {
                let bus = InvalidationBus::new(
                    client.clone(),
                    keys.clone(),
                    options.instance_id,
                    options.flush_local_on_bus_reconnect,
                );
                let locks = LockManager::new(client.clone(), keys.clone(), options.sync_timeout);
                let pattern = PatternEngine::new(client.clone(), keys.clone());

                let subscriber_bus = bus.clone();
                let subscriber_local = local.clone();
                let subscriber_cancellation = cancellation.clone();
                let max_reconnects = options.bus_reconnect_limit;
                let handle = tokio::spawn(async move {
                    subscriber_bus
                        .run(subscriber_local, subscriber_cancellation, max_reconnects)
                        .await;
                });

                (Some(bus), Some(locks), Some(pattern), Some(handle))
            }
            None => (None, None, None, None),
        };

        Ok(Self {
            options,
            keys,
            local,
            redis,
            bus,
            locks,
            pattern,
            cancellation,
            subscriber,
        })
    }

    /// Unsubscribe the invalidation bus, stop the background subscriber
    /// task, and drop the local store.
    pub async fn shutdown(mut self) {
        self.cancellation.cancel();
        if let Some(handle) = self.subscriber.take() {
            let _ = handle.await;
        }
        self.local.clear().await;
    }

    fn degraded(&self) -> bool {
        self.redis.is_none()
    }

    // ---- Read ----------------------------------------------------

    /// Look up `key`. Checks the local tier first; on miss, reads
    /// through to Redis and repopulates the local tier with a TTL
    /// bounded by the remote key's remaining TTL.
    #[instrument(skip(self), fields(cache.operation = "GET"))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let scoped = self.keys.scope(key)?;

        if let Some(bytes) = self.local.get(&scoped).await {
            if self.options.enable_logging {
                debug!(key = %scoped, "local tier hit");
            }
            return Ok(Some(serializer::decode(&bytes)?));
        }

        let Some(redis) = &self.redis else {
            return Ok(None);
        };

        if self.options.enable_logging {
            debug!(key = %scoped, "local tier miss, reading through to redis");
        }

        let bytes = match redis.string_get(&scoped).await {
            Ok(b) => b,
            Err(e) => return self.swallow_or_raise_option(e),
        };

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let remote_remaining = redis.key_expire_time(&scoped).await.unwrap_or(None);
        let ttl = resolve_local_ttl(None, remote_remaining, self.options.default_expiration);
        self.local.set(scoped, bytes.clone(), ttl).await;

        Ok(Some(serializer::decode(&bytes)?))
    }

    /// Like [`get`](Self::get), decomposed into a found/not-found flag
    /// and the value, rather than folding both into `Option`.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<(bool, Option<T>)> {
        match self.get(key).await? {
            Some(value) => Ok((true, Some(value))),
            None => Ok((false, None)),
        }
    }

    /// Look up `key`; on miss, invoke `producer`, store its result with
    /// default per-call options, and return it.
    pub async fn get_or_create<T, F, Fut>(&self, key: &str, producer: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CacheResult<T>>,
    {
        if let Some(value) = self.get::<T>(key).await? {
            return Ok(value);
        }
        let value = producer().await?;
        self.set(key, &value, HybridCacheEntryOptions::default()).await?;
        Ok(value)
    }

    fn swallow_or_raise_option<T>(&self, e: CacheError) -> CacheResult<Option<T>> {
        if self.options.throw_on_distributed_error {
            Err(e)
        } else {
            warn!(error = %e, "redis error swallowed, falling back to local tier");
            Ok(None)
        }
    }

    // ---- Write -----------------------------------------------------

    /// Write `value` under `key` per `opts`.
    ///
    /// Returns `false` only when a conditional write (`opts.when`) did
    /// not fire; in that case nothing changes and no invalidation is
    /// published.
    #[instrument(skip(self, value), fields(cache.operation = "SET"))]
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        opts: HybridCacheEntryOptions,
    ) -> CacheResult<bool> {
        let scoped = self.keys.scope(key)?;
        let bytes = serializer::encode(value)?;

        if self.options.enable_logging {
            debug!(key = %scoped, local = opts.local_cache_enable, redis = opts.redis_cache_enable, "writing entry");
        }

        // The Redis conditional write (if any) must be checked before the
        // local tier is touched: a rejected `IfNotExists`/`IfExists` write
        // must leave the prior local value in place, not be clobbered by
        // the value that Redis just refused to store.
        if opts.redis_cache_enable {
            if let Some(redis) = &self.redis {
                let ttl = opts.redis_expiry.unwrap_or(self.options.default_expiration);
                let wrote = match redis
                    .string_set(&scoped, bytes.clone(), Some(ttl), opts.when, opts.keep_ttl, opts.flags)
                    .await
                {
                    Ok(wrote) => wrote,
                    Err(e) => {
                        if self.options.throw_on_distributed_error {
                            return Err(e);
                        }
                        warn!(error = %e, "redis write swallowed, local tier updated only");
                        true
                    }
                };

                if !wrote {
                    return Ok(false);
                }
            }
        }

        if opts.local_cache_enable {
            let ttl = opts.local_expiry.unwrap_or(self.options.default_expiration);
            self.local.set(scoped.clone(), bytes, ttl).await;
        }

        self.publish_key_invalidated(&scoped).await?;
        Ok(true)
    }

    /// Write every entry in `entries` sequentially under `opts`,
    /// publishing one consolidated invalidation message for every key
    /// successfully written.
    pub async fn set_all<T: Serialize>(
        &self,
        entries: &[(String, T)],
        opts: HybridCacheEntryOptions,
    ) -> CacheResult<u64> {
        let mut scoped_written = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            let scoped = self.keys.scope(key)?;
            let bytes = serializer::encode(value)?;

            if opts.redis_cache_enable {
                if let Some(redis) = &self.redis {
                    let ttl = opts.redis_expiry.unwrap_or(self.options.default_expiration);
                    match redis
                        .string_set(&scoped, bytes.clone(), Some(ttl), opts.when, opts.keep_ttl, opts.flags)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => continue,
                        Err(e) if self.options.throw_on_distributed_error => return Err(e),
                        Err(e) => {
                            warn!(error = %e, "redis write swallowed during set_all");
                        }
                    }
                }
            }

            if opts.local_cache_enable {
                let ttl = opts.local_expiry.unwrap_or(self.options.default_expiration);
                self.local.set(scoped.clone(), bytes, ttl).await;
            }

            scoped_written.push(scoped);
        }

        if let Some(bus) = &self.bus {
            if let Err(e) = bus
                .publish_keys_invalidated_with_retry(&scoped_written, self.options.bus_retry_count)
                .await
            {
                if self.options.throw_on_distributed_error {
                    return Err(e);
                }
                warn!(error = %e, "invalidation publish swallowed during set_all");
            }
        }

        Ok(scoped_written.len() as u64)
    }

    async fn publish_key_invalidated(&self, scoped_key: &str) -> CacheResult<()> {
        let Some(bus) = &self.bus else {
            return Ok(());
        };
        match bus
            .publish_key_invalidated_with_retry(scoped_key, self.options.bus_retry_count)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if self.options.throw_on_distributed_error => Err(e),
            Err(e) => {
                warn!(error = %e, "invalidation publish swallowed");
                Ok(())
            }
        }
    }

    // ---- Remove ------------------------------------------------------

    /// Remove `keys` from both tiers and publish one invalidation
    /// message listing them.
    pub async fn remove(&self, keys: &[String]) -> CacheResult<()> {
        if keys.is_empty() {
            return Err(CacheError::EmptyKeyList);
        }

        let mut scoped_keys = Vec::with_capacity(keys.len());
        for key in keys {
            let scoped = self.keys.scope(key)?;
            self.local.remove(&scoped).await;
            scoped_keys.push(scoped);
        }

        if let Some(redis) = &self.redis {
            if let Err(e) = redis.key_delete(&scoped_keys).await {
                if self.options.throw_on_distributed_error {
                    return Err(e);
                }
                warn!(error = %e, "redis delete swallowed, local tier removal still applied");
            }
        }

        if let Some(bus) = &self.bus {
            if let Err(e) = bus
                .publish_keys_invalidated_with_retry(&scoped_keys, self.options.bus_retry_count)
                .await
            {
                if self.options.throw_on_distributed_error {
                    return Err(e);
                }
                warn!(error = %e, "invalidation publish swallowed during remove");
            }
        }

        Ok(())
    }

    /// Remove every key matching `user_pattern` from Redis, publishing a
    /// single pattern-scoped invalidation message rather than one entry
    /// per removed key — a pattern removal can span thousands of keys,
    /// and a message carrying all of them would blow past the
    /// transport's size limit. Returns the removed (or, for
    /// fire-and-forget, dispatched) count.
    pub async fn remove_by_pattern(&self, user_pattern: &str, flags: CommandFlags) -> CacheResult<u64> {
        let Some(pattern) = &self.pattern else {
            return Ok(0);
        };

        let removed = pattern
            .remove_by_pattern(user_pattern, flags, DEFAULT_BATCH_SIZE)
            .await?;

        // The local tier has no glob-aware removal (same reason the
        // `Pattern` invalidation receive-arm does a full clear); the
        // invalidation bus self-suppresses this instance's own publish,
        // so this instance must clear its own local tier directly.
        self.local.clear().await;

        if let Some(bus) = &self.bus {
            let scoped_pattern = self.keys.scoped_pattern(user_pattern);
            if let Err(e) = bus
                .publish_pattern_invalidated_with_retry(&scoped_pattern, self.options.bus_retry_count)
                .await
            {
                if self.options.throw_on_distributed_error {
                    return Err(e);
                }
                warn!(error = %e, "invalidation publish swallowed during remove_by_pattern");
            }
        }

        Ok(removed)
    }

    /// Like [`remove_by_pattern`](Self::remove_by_pattern) but skips
    /// publishing local invalidation — for callers who know no local
    /// copies of the matched keys exist anywhere.
    pub async fn remove_by_pattern_on_redis_only(&self, user_pattern: &str) -> CacheResult<u64> {
        match &self.pattern {
            Some(pattern) => pattern.remove_by_pattern_on_redis_only(user_pattern).await,
            None => Ok(0),
        }
    }

    /// Clear only this instance's local tier; does not touch Redis or
    /// broadcast to other instances.
    pub async fn clear_local(&self) {
        self.local.clear().await;
    }

    /// Clear the local tier, flush the Redis database (requires
    /// `options.allow_admin`), and notify other instances to clear
    /// their local tiers too.
    pub async fn clear_all(&self) -> CacheResult<()> {
        if !self.options.allow_admin {
            return Err(CacheError::AdminDisabled);
        }

        self.local.clear().await;

        if let Some(redis) = &self.redis {
            redis.flush_db().await?;
        }

        if let Some(bus) = &self.bus {
            bus.publish_clear_with_retry(self.options.bus_retry_count).await?;
        }

        Ok(())
    }

    // ---- Inspect -------------------------------------------------

    /// Whether `key` exists in either tier.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let scoped = self.keys.scope(key)?;
        if self.local.get(&scoped).await.is_some() {
            return Ok(true);
        }
        match &self.redis {
            Some(redis) => Ok(redis.key_exists(&scoped).await?),
            None => Ok(false),
        }
    }

    /// Remaining TTL for `key` in Redis, or `None` if it has no expiry,
    /// does not exist, or this instance is degraded.
    pub async fn get_expiration(&self, key: &str) -> CacheResult<Option<Duration>> {
        let scoped = self.keys.scope(key)?;
        match &self.redis {
            Some(redis) => Ok(redis.key_expire_time(&scoped).await?),
            None => Ok(None),
        }
    }

    /// Stream every key matching `user_pattern`.
    pub fn keys<'a>(&'a self, user_pattern: &'a str) -> impl futures::Stream<Item = CacheResult<String>> + 'a {
        async_stream::try_stream! {
            match &self.pattern {
                Some(pattern) => {
                    let mut stream = std::pin::pin!(pattern.keys(user_pattern));
                    while let Some(item) = futures::StreamExt::next(&mut stream).await {
                        yield item?;
                    }
                }
                None => {}
            }
        }
    }

    /// Number of keys in the remote database. Requires
    /// `options.allow_admin`.
    pub async fn database_size(&self) -> CacheResult<i64> {
        if !self.options.allow_admin {
            return Err(CacheError::AdminDisabled);
        }
        match &self.redis {
            Some(redis) => redis.dbsize().await,
            None => Ok(0),
        }
    }

    /// Round-trip latency to the Redis server.
    pub async fn ping(&self) -> CacheResult<Duration> {
        match &self.redis {
            Some(redis) => redis.ping().await,
            None => Ok(Duration::ZERO),
        }
    }

    /// Server-reported time as `(unix_seconds, microseconds)`.
    pub async fn time(&self) -> CacheResult<(i64, i64)> {
        match &self.redis {
            Some(redis) => redis.time().await,
            None => Ok((
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64,
                0,
            )),
        }
    }

    /// Echo `message` back off the Redis server.
    pub async fn echo(&self, message: &str) -> CacheResult<String> {
        match &self.redis {
            Some(redis) => redis.echo(message).await,
            None => Ok(message.to_string()),
        }
    }

    /// Redis server version string.
    pub async fn server_version(&self) -> CacheResult<String> {
        match &self.redis {
            Some(redis) => redis.server_version().await,
            None => Err(CacheError::Protocol("no redis connection in degraded mode".into())),
        }
    }

    /// Whether this instance is running in degraded local-only mode.
    pub fn server_features(&self) -> CacheFeatures {
        CacheFeatures {
            redis_connected: !self.degraded(),
        }
    }

    // ---- Locking -------------------------------------------------

    /// Attempt to acquire the lock on `key` once, without blocking.
    pub async fn try_lock(&self, key: &str, ttl: Duration) -> CacheResult<Option<LockGuard>> {
        let scoped = self.keys.scope(key)?;
        match &self.locks {
            Some(locks) => locks.try_lock(&scoped, ttl).await,
            None => Ok(None),
        }
    }

    /// Block (cooperatively, with backoff) until the lock on `key` is
    /// acquired, `timeout` elapses, or `cancellation` fires.
    pub async fn lock_key(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> CacheResult<Option<LockGuard>> {
        let scoped = self.keys.scope(key)?;
        match &self.locks {
            Some(locks) => locks.lock(&scoped, ttl, timeout, cancellation).await,
            None => Ok(None),
        }
    }
}

/// Capability flags reported by [`HybridCache::server_features`].
#[derive(Debug, Clone, Copy)]
pub struct CacheFeatures {
    pub redis_connected: bool,
}
