//! Hybrid two-tier cache: a bounded local tier kept coherent with a
//! shared Redis tier through pub/sub invalidation, plus distributed
//! locking and pattern-based bulk removal over the same namespace.
//!
//! [`HybridCache`] is the entry point; construct it from
//! [`HybridCacheOptions`] and keep it alive for the process lifetime.

pub mod cache;
pub mod config;
pub mod error;
pub mod expiration;
pub mod invalidation;
pub mod keys;
pub mod local_store;
pub mod lock;
pub mod pattern;
pub mod redis_client;
pub mod serializer;

pub use cache::{CacheFeatures, HybridCache};
pub use config::{CommandFlags, HybridCacheEntryOptions, HybridCacheOptions, SetCondition};
pub use error::{CacheError, CacheResult};
pub use lock::LockGuard;
