//! Cross-instance invalidation via Redis pub/sub.
//!
//! A dedicated `client.get_async_pubsub()` connection (a
//! `ConnectionManager` cannot subscribe) backs the background
//! subscriber: `subscribe` plus `on_message()`, raced against a
//! [`CancellationToken`] via `tokio::select!` for graceful shutdown.
//! Self-loopback suppression ensures a node never evicts its own
//! freshly-written entry on the echo of its own publish.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheResult;
use crate::keys::KeyNamer;
use crate::local_store::LocalStore;
use crate::redis_client::RedisClient;

/// Delay between reconnect attempts when the subscriber connection drops.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Base delay for the linear publish-retry backoff (`delay = base ×
/// attempt`).
const PUBLISH_RETRY_BASE: Duration = Duration::from_millis(50);

/// Wire message published on the namespace's invalidation channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum InvalidationMessage {
    /// A single scoped key was written or removed elsewhere.
    Key { origin: Uuid, scoped_key: String },
    /// A batch of scoped keys were written or removed elsewhere in one
    /// `set_all`/pattern-removal call (split across messages upstream if
    /// the batch would exceed a transport size limit).
    Keys { origin: Uuid, scoped_keys: Vec<String> },
    /// Every entry under a scoped glob pattern was removed elsewhere.
    Pattern { origin: Uuid, scoped_pattern: String },
    /// The entire namespace was cleared elsewhere.
    Clear { origin: Uuid },
}

/// Publishes and subscribes to the namespace's cross-instance
/// invalidation channel, applying remote invalidations to the local
/// tier.
#[derive(Clone)]
pub struct InvalidationBus {
    redis: RedisClient,
    keys: KeyNamer,
    instance_id: Uuid,
    flush_local_on_reconnect: bool,
}

impl InvalidationBus {
    pub fn new(
        redis: RedisClient,
        keys: KeyNamer,
        instance_id: Uuid,
        flush_local_on_reconnect: bool,
    ) -> Self {
        Self {
            redis,
            keys,
            instance_id,
            flush_local_on_reconnect,
        }
    }

    /// Tell other instances that `scoped_key` changed.
    pub async fn publish_key_invalidated(&self, scoped_key: &str) -> CacheResult<()> {
        self.publish(&InvalidationMessage::Key {
            origin: self.instance_id,
            scoped_key: scoped_key.to_string(),
        })
        .await
    }

    /// Tell other instances that a batch of scoped keys changed.
    pub async fn publish_keys_invalidated(&self, scoped_keys: &[String]) -> CacheResult<()> {
        if scoped_keys.is_empty() {
            return Ok(());
        }
        self.publish(&InvalidationMessage::Keys {
            origin: self.instance_id,
            scoped_keys: scoped_keys.to_vec(),
        })
        .await
    }

    /// Tell other instances that every key under `scoped_pattern` was
    /// removed.
    pub async fn publish_pattern_invalidated(&self, scoped_pattern: &str) -> CacheResult<()> {
        self.publish(&InvalidationMessage::Pattern {
            origin: self.instance_id,
            scoped_pattern: scoped_pattern.to_string(),
        })
        .await
    }

    /// Tell other instances that the namespace was cleared.
    pub async fn publish_clear(&self) -> CacheResult<()> {
        self.publish(&InvalidationMessage::Clear {
            origin: self.instance_id,
        })
        .await
    }

    /// Publish `message`, retrying up to `retry_count` times with linear
    /// backoff (`delay = base × attempt`) on transport error.
    async fn publish_with_retry(
        &self,
        message: &InvalidationMessage,
        retry_count: u32,
    ) -> CacheResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.publish(message).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > retry_count {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "invalidation publish failed, retrying");
                    tokio::time::sleep(PUBLISH_RETRY_BASE * attempt).await;
                }
            }
        }
    }

    /// [`publish_key_invalidated`](Self::publish_key_invalidated) with
    /// linear backoff retry.
    pub async fn publish_key_invalidated_with_retry(
        &self,
        scoped_key: &str,
        retry_count: u32,
    ) -> CacheResult<()> {
        self.publish_with_retry(
            &InvalidationMessage::Key {
                origin: self.instance_id,
                scoped_key: scoped_key.to_string(),
            },
            retry_count,
        )
        .await
    }

    /// [`publish_keys_invalidated`](Self::publish_keys_invalidated) with
    /// linear backoff retry.
    pub async fn publish_keys_invalidated_with_retry(
        &self,
        scoped_keys: &[String],
        retry_count: u32,
    ) -> CacheResult<()> {
        if scoped_keys.is_empty() {
            return Ok(());
        }
        self.publish_with_retry(
            &InvalidationMessage::Keys {
                origin: self.instance_id,
                scoped_keys: scoped_keys.to_vec(),
            },
            retry_count,
        )
        .await
    }

    /// [`publish_pattern_invalidated`](Self::publish_pattern_invalidated)
    /// with linear backoff retry.
    pub async fn publish_pattern_invalidated_with_retry(
        &self,
        scoped_pattern: &str,
        retry_count: u32,
    ) -> CacheResult<()> {
        self.publish_with_retry(
            &InvalidationMessage::Pattern {
                origin: self.instance_id,
                scoped_pattern: scoped_pattern.to_string(),
            },
            retry_count,
        )
        .await
    }

    /// [`publish_clear`](Self::publish_clear) with linear backoff retry.
    pub async fn publish_clear_with_retry(&self, retry_count: u32) -> CacheResult<()> {
        self.publish_with_retry(
            &InvalidationMessage::Clear {
                origin: self.instance_id,
            },
            retry_count,
        )
        .await
    }

    async fn publish(&self, message: &InvalidationMessage) -> CacheResult<()> {
        let bytes = crate::serializer::encode(message)?;
        self.redis
            .publish(&self.keys.invalidation_channel(), bytes)
            .await?;
        Ok(())
    }

    /// Run the subscriber loop until `cancellation` fires, applying
    /// every remote invalidation to `local`. Reconnects on a dropped
    /// pub/sub connection, retrying up to `max_reconnects` times before
    /// giving up (a caller that wants an immortal subscriber passes
    /// `u32::MAX`).
    pub async fn run(self, local: LocalStore, cancellation: CancellationToken, max_reconnects: u32) {
        let channel = self.keys.invalidation_channel();
        let mut attempts = 0u32;

        loop {
            if cancellation.is_cancelled() {
                return;
            }

            match self.subscribe_once(&channel, &local, &cancellation).await {
                Ok(()) => return, // clean shutdown via cancellation
                Err(e) => {
                    attempts += 1;
                    warn!(error = %e, attempts, "invalidation subscriber disconnected");
                    if attempts > max_reconnects {
                        warn!("invalidation subscriber giving up after exhausting reconnect budget");
                        return;
                    }
                    if self.flush_local_on_reconnect {
                        debug!("flushing local tier before invalidation-bus reconnect");
                        local.clear().await;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                        _ = cancellation.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn subscribe_once(
        &self,
        channel: &str,
        local: &LocalStore,
        cancellation: &CancellationToken,
    ) -> CacheResult<()> {
        let client = self.redis.raw_client();
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                maybe_msg = futures::StreamExt::next(&mut stream) => {
                    let Some(msg) = maybe_msg else {
                        return Err(crate::error::CacheError::Protocol(
                            "invalidation pub/sub stream ended".into(),
                        ));
                    };
                    let payload: Vec<u8> = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "malformed invalidation payload");
                            continue;
                        }
                    };
                    self.apply(&payload, local).await;
                }
                _ = cancellation.cancelled() => return Ok(()),
            }
        }
    }

    async fn apply(&self, payload: &[u8], local: &LocalStore) {
        let message: InvalidationMessage = match crate::serializer::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "could not decode invalidation message");
                return;
            }
        };

        match message {
            InvalidationMessage::Key { origin, scoped_key } => {
                if origin == self.instance_id {
                    return;
                }
                local.remove(&scoped_key).await;
            }
            InvalidationMessage::Keys { origin, scoped_keys } => {
                if origin == self.instance_id {
                    return;
                }
                for scoped_key in scoped_keys {
                    local.remove(&scoped_key).await;
                }
            }
            InvalidationMessage::Pattern { origin, .. } if origin == self.instance_id => {}
            InvalidationMessage::Pattern { .. } => {
                // The local tier has no glob-aware removal; a full
                // clear is the conservative response to a remote
                // pattern-wide removal.
                local.clear().await;
            }
            InvalidationMessage::Clear { origin } => {
                if origin == self.instance_id {
                    return;
                }
                local.clear().await;
            }
        }
    }
}
