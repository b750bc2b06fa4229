//! Hybrid cache configuration.
//!
//! Loaded from environment variables, falling back to an
//! `unwrap_or_else` default per field when unset.

use std::env;
use std::time::Duration;

use uuid::Uuid;

/// Construction-time options for a [`crate::cache::HybridCache`].
///
/// Read-only after construction.
#[derive(Clone, Debug)]
pub struct HybridCacheOptions {
    /// Namespace shared by every cooperating instance; scopes keys and
    /// the invalidation channel.
    pub instances_shared_name: String,

    /// Redis connection string (e.g. `redis://127.0.0.1:6379`).
    pub redis_connect_string: String,

    /// Fallback TTL used when a write specifies no expiry.
    pub default_expiration: Duration,

    /// Maximum number of publish retries on the invalidation bus.
    ///
    /// This governs a single `PUBLISH` call's own retry loop only. The
    /// background subscriber's reconnect budget is a separate knob,
    /// [`Self::bus_reconnect_limit`] — conflating the two would mean a
    /// handful of transient reconnects exhausts a budget sized for
    /// publish retries and permanently stops this instance from
    /// receiving cross-instance invalidations.
    pub bus_retry_count: u32,

    /// Maximum number of times the background invalidation subscriber
    /// reconnects after its pub/sub connection drops, before giving up
    /// for the rest of the process's life. Defaults far higher than
    /// `bus_retry_count` since a dropped subscriber connection is a
    /// routine network blip, not a fatal condition; set to `u32::MAX`
    /// for an effectively unbounded reconnect loop.
    pub bus_reconnect_limit: u32,

    /// Whether a distributed (Redis/bus) error is surfaced to the
    /// caller or swallowed with a log line.
    pub throw_on_distributed_error: bool,

    /// Whether the local store is fully cleared when the transport
    /// signals a reconnect.
    pub flush_local_on_bus_reconnect: bool,

    /// Whether construction fails outright if the initial connect
    /// fails, versus degrading to local-only mode.
    pub abort_on_connect_fail: bool,

    /// Number of initial-connect attempts.
    ///
    /// A lower bound on total connect time only: the underlying `redis`
    /// client may add its own retry/backoff latency this crate does not
    /// observe or control.
    pub connect_retry: u32,

    /// Per-attempt connection timeout.
    pub connection_timeout: Duration,

    /// Timeout applied to synchronous-shaped command sequences
    /// (e.g. the blocking poll loop inside `lock_key`).
    pub sync_timeout: Duration,

    /// Timeout applied to a single asynchronous command.
    pub async_timeout: Duration,

    /// Whether admin-only operations (`database_size`, `clear_all`)
    /// are permitted.
    pub allow_admin: bool,

    /// Whether this instance emits `tracing` events for cache
    /// operations. Spans are always created; this only gates the
    /// `debug!`/`info!` event bodies inside them.
    pub enable_logging: bool,

    /// Process-unique id assigned at construction, used to suppress
    /// self-originated invalidation messages.
    pub instance_id: Uuid,

    /// Upper bound on the number of entries held in the local tier.
    pub local_max_entries: u64,

    /// Transport keepalive cadence. Accepted for parity with the
    /// option surface; `redis`'s `ConnectionManager` does not expose a
    /// knob for TCP keepalive tuning in the version this crate depends
    /// on, so the field is currently inert beyond validation.
    pub keep_alive: Duration,
}

impl HybridCacheOptions {
    /// Load configuration from environment variables, falling back to
    /// sensible defaults for anything unset.
    ///
    /// # Environment variables
    ///
    /// - `INSTANCES_SHARED_NAME` (default: `hybrid-cache`)
    /// - `REDIS_URL` (default: `redis://127.0.0.1:6379`)
    /// - `DEFAULT_EXPIRATION_SECONDS` (default: `300`)
    /// - `BUS_RETRY_COUNT` (default: `3`)
    /// - `BUS_RECONNECT_LIMIT` (default: `10000`)
    /// - `THROW_ON_DISTRIBUTED_ERROR` (default: `false`)
    /// - `FLUSH_LOCAL_ON_BUS_RECONNECT` (default: `true`)
    /// - `ABORT_ON_CONNECT_FAIL` (default: `false`)
    /// - `CONNECT_RETRY` (default: `3`)
    /// - `CONNECTION_TIMEOUT_MS` (default: `5000`)
    /// - `SYNC_TIMEOUT_MS` (default: `5000`)
    /// - `ASYNC_TIMEOUT_MS` (default: `5000`)
    /// - `ALLOW_ADMIN` (default: `false`)
    /// - `ENABLE_LOGGING` (default: `true`)
    /// - `LOCAL_MAX_ENTRIES` (default: `100000`)
    /// - `KEEP_ALIVE_SECONDS` (default: `60`)
    pub fn from_env() -> Self {
        Self {
            instances_shared_name: env::var("INSTANCES_SHARED_NAME")
                .unwrap_or_else(|_| "hybrid-cache".into()),
            redis_connect_string: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            default_expiration: Duration::from_secs(
                env::var("DEFAULT_EXPIRATION_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
            bus_retry_count: env::var("BUS_RETRY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            bus_reconnect_limit: env::var("BUS_RECONNECT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            throw_on_distributed_error: env::var("THROW_ON_DISTRIBUTED_ERROR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            flush_local_on_bus_reconnect: env::var("FLUSH_LOCAL_ON_BUS_RECONNECT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            abort_on_connect_fail: env::var("ABORT_ON_CONNECT_FAIL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            connect_retry: env::var("CONNECT_RETRY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            connection_timeout: Duration::from_millis(
                env::var("CONNECTION_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
            sync_timeout: Duration::from_millis(
                env::var("SYNC_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
            async_timeout: Duration::from_millis(
                env::var("ASYNC_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            ),
            allow_admin: env::var("ALLOW_ADMIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            enable_logging: env::var("ENABLE_LOGGING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            instance_id: Uuid::new_v4(),
            local_max_entries: env::var("LOCAL_MAX_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100_000),
            keep_alive: Duration::from_secs(
                env::var("KEEP_ALIVE_SECONDS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
        }
    }
}

impl Default for HybridCacheOptions {
    fn default() -> Self {
        Self {
            instances_shared_name: "hybrid-cache".into(),
            redis_connect_string: "redis://127.0.0.1:6379".into(),
            default_expiration: Duration::from_secs(300),
            bus_retry_count: 3,
            bus_reconnect_limit: 10_000,
            throw_on_distributed_error: false,
            flush_local_on_bus_reconnect: true,
            abort_on_connect_fail: false,
            connect_retry: 3,
            connection_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            async_timeout: Duration::from_secs(5),
            allow_admin: false,
            enable_logging: true,
            instance_id: Uuid::new_v4(),
            local_max_entries: 100_000,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Write condition for a `Set` operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SetCondition {
    /// Always write, unconditionally.
    #[default]
    Always,
    /// Only write if the key does not already exist (`SET NX`).
    IfNotExists,
    /// Only write if the key already exists (`SET XX`).
    IfExists,
}

/// Routing/dispatch hints for a single command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Prefer routing the command to a replica when one is available.
    ///
    /// Accepted for parity with the option surface but currently inert:
    /// `RedisClient` talks to the server through a single
    /// `redis::aio::ConnectionManager`, which has no cluster/replica
    /// topology to route across. `RedisClient` logs once per call when
    /// this is set so the gap is visible rather than silent.
    pub prefer_replica: bool,
    /// Require the command to be routed to the master.
    ///
    /// Inert for the same reason as `prefer_replica`: there is only one
    /// connection to route through.
    pub demand_master: bool,
    /// Dispatch without awaiting acknowledgement.
    pub fire_and_forget: bool,
}

/// Per-call options for [`crate::cache::HybridCache::set`] and friends.
///
/// Built with `with_x(mut self) -> Self` methods so call sites read as
/// a chain of adjustments from the default.
#[derive(Clone, Debug)]
pub struct HybridCacheEntryOptions {
    /// TTL applied to the local tier. `None` falls back to the
    /// configured default.
    pub local_expiry: Option<Duration>,
    /// TTL applied to the Redis tier. `None` falls back to the
    /// configured default.
    pub redis_expiry: Option<Duration>,
    /// Whether this write touches the local tier at all.
    pub local_cache_enable: bool,
    /// Whether this write touches the Redis tier at all.
    pub redis_cache_enable: bool,
    /// Command dispatch flags.
    pub flags: CommandFlags,
    /// Whether an existing key's TTL should be preserved on overwrite.
    pub keep_ttl: bool,
    /// Conditional-write predicate.
    pub when: SetCondition,
}

impl Default for HybridCacheEntryOptions {
    fn default() -> Self {
        Self {
            local_expiry: None,
            redis_expiry: None,
            local_cache_enable: true,
            redis_cache_enable: true,
            flags: CommandFlags::default(),
            keep_ttl: false,
            when: SetCondition::Always,
        }
    }
}

impl HybridCacheEntryOptions {
    /// Start from defaults with an explicit local TTL.
    #[must_use]
    pub fn with_local_expiry(mut self, ttl: Duration) -> Self {
        self.local_expiry = Some(ttl);
        self
    }

    /// Start from defaults with an explicit Redis TTL.
    #[must_use]
    pub fn with_redis_expiry(mut self, ttl: Duration) -> Self {
        self.redis_expiry = Some(ttl);
        self
    }

    /// Convert an absolute UTC instant into a relative Redis TTL.
    #[must_use]
    pub fn with_redis_expiry_utc_time(mut self, at: std::time::SystemTime) -> Self {
        let remaining = at
            .duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.redis_expiry = Some(remaining);
        self
    }

    /// Preserve the existing remote TTL on overwrite.
    #[must_use]
    pub fn with_keep_ttl(mut self) -> Self {
        self.keep_ttl = true;
        self
    }

    /// Apply a conditional-write predicate.
    #[must_use]
    pub fn when(mut self, condition: SetCondition) -> Self {
        self.when = condition;
        self
    }

    /// Mark this write as fire-and-forget.
    #[must_use]
    pub fn fire_and_forget(mut self) -> Self {
        self.flags.fire_and_forget = true;
        self
    }
}
