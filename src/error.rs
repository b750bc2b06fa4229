//! Error taxonomy for the hybrid cache.
//!
//! Validation and protocol errors are always surfaced; transport errors
//! are governed by
//! [`crate::config::HybridCacheOptions::throw_on_distributed_error`];
//! lock token mismatches are not errors at all — `try_extend`/
//! `try_release` return `Ok(false)` instead.

use std::time::Duration;

/// Errors that can occur while operating the hybrid cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A caller-supplied key was empty or whitespace-only.
    #[error("cache key must not be empty")]
    InvalidKey,

    /// A bulk operation was given an empty key list.
    #[error("key list must not be empty")]
    EmptyKeyList,

    /// The Redis transport returned an error.
    #[error("redis transport error: {0}")]
    Connection(#[from] redis::RedisError),

    /// A value failed to encode or decode.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A command did not complete within its configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server returned a reply the client did not expect.
    ///
    /// Always surfaced: this indicates a bug rather than an
    /// environmental failure.
    #[error("unexpected redis protocol reply: {0}")]
    Protocol(String),

    /// An admin-only operation was attempted while `AllowAdmin` is false.
    #[error("admin operations are disabled (set AllowAdmin to enable)")]
    AdminDisabled,
}

/// Convenience alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;
