//! Bounded, concurrent, per-entry-TTL local cache tier.
//!
//! Stores the *serialized* form of a value, not a type-erased native
//! object, keyed by scoped key. Backed by `moka`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

/// A value plus the TTL it should live for from the moment it is
/// inserted or overwritten.
///
/// moka's builder-level `time_to_live` is a single fixed policy; this
/// crate needs an independently computed TTL per entry, so a
/// per-entry [`Expiry`] implementation reads it off the stored value
/// instead.
#[derive(Clone)]
struct LocalEntry {
    bytes: Arc<Vec<u8>>,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, LocalEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// The process-local in-memory cache tier.
///
/// Safe for concurrent use; no cross-key ordering guarantees.
#[derive(Clone)]
pub struct LocalStore {
    inner: Cache<String, LocalEntry>,
}

impl LocalStore {
    /// Create a new store bounded to `max_entries`.
    pub fn new(max_entries: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryExpiry)
            .build();
        Self { inner }
    }

    /// Look up `scoped_key`. Returns `None` on miss or if the entry's
    /// TTL has elapsed (moka evicts lazily on access).
    pub async fn get(&self, scoped_key: &str) -> Option<Vec<u8>> {
        self.inner
            .get(scoped_key)
            .await
            .map(|entry| entry.bytes.as_ref().clone())
    }

    /// Insert or overwrite `scoped_key` with `bytes`, expiring after
    /// `ttl`.
    pub async fn set(&self, scoped_key: String, bytes: Vec<u8>, ttl: Duration) {
        self.inner
            .insert(
                scoped_key,
                LocalEntry {
                    bytes: Arc::new(bytes),
                    ttl,
                },
            )
            .await;
    }

    /// Remove `scoped_key` if present.
    pub async fn remove(&self, scoped_key: &str) {
        self.inner.invalidate(scoped_key).await;
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.inner.invalidate_all();
        // `invalidate_all` is lazy; run pending tasks so callers can
        // rely on `entry_count()` reflecting the clear immediately
        // afterwards (used by tests and `clear_local`'s bookkeeping).
        self.inner.run_pending_tasks().await;
    }

    /// Approximate number of entries currently held (may lag actual
    /// state briefly, per moka's eventual-consistency bookkeeping).
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = LocalStore::new(100);
        store
            .set("app:k".to_string(), b"v1".to_vec(), Duration::from_secs(60))
            .await;
        assert_eq!(store.get("app:k").await, Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn get_on_miss_returns_none() {
        let store = LocalStore::new(100);
        assert_eq!(store.get("app:missing").await, None);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let store = LocalStore::new(100);
        store
            .set("app:k".to_string(), b"v1".to_vec(), Duration::from_secs(60))
            .await;
        store.remove("app:k").await;
        assert_eq!(store.get("app:k").await, None);
    }

    #[tokio::test]
    async fn idempotent_remove() {
        let store = LocalStore::new(100);
        store
            .set("app:k".to_string(), b"v1".to_vec(), Duration::from_secs(60))
            .await;
        store.remove("app:k").await;
        store.remove("app:k").await;
        assert_eq!(store.get("app:k").await, None);
    }

    #[tokio::test]
    async fn entry_expires_after_its_own_ttl() {
        let store = LocalStore::new(100);
        store
            .set(
                "app:k".to_string(),
                b"v1".to_vec(),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(store.get("app:k").await, Some(b"v1".to_vec()));
        sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("app:k").await, None);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let store = LocalStore::new(100);
        store
            .set("app:a".to_string(), b"1".to_vec(), Duration::from_secs(60))
            .await;
        store
            .set("app:b".to_string(), b"2".to_vec(), Duration::from_secs(60))
            .await;
        store.clear().await;
        assert_eq!(store.get("app:a").await, None);
        assert_eq!(store.get("app:b").await, None);
    }

    #[tokio::test]
    async fn overwrite_resets_ttl_to_new_value() {
        let store = LocalStore::new(100);
        store
            .set(
                "app:k".to_string(),
                b"v1".to_vec(),
                Duration::from_millis(20),
            )
            .await;
        store
            .set("app:k".to_string(), b"v2".to_vec(), Duration::from_secs(60))
            .await;
        sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("app:k").await, Some(b"v2".to_vec()));
    }
}
