//! Glob-pattern key enumeration and bulk removal.
//!
//! The cursor loop is exposed as a lazy [`Stream`] (rather than
//! collected eagerly) via `async-stream`, and results are translated
//! back through [`KeyNamer::unscope`] so callers only ever see their
//! own keys.

use futures::Stream;

use crate::config::CommandFlags;
use crate::error::CacheResult;
use crate::keys::KeyNamer;
use crate::redis_client::RedisClient;

/// Page size requested per `SCAN` round trip.
const SCAN_COUNT: u64 = 250;

/// Enumerates and bulk-removes keys under a namespace by glob pattern.
#[derive(Clone)]
pub struct PatternEngine {
    redis: RedisClient,
    keys: KeyNamer,
}

impl PatternEngine {
    pub fn new(redis: RedisClient, keys: KeyNamer) -> Self {
        Self { redis, keys }
    }

    /// Lazily stream every remote key matching `user_pattern`, unscoped
    /// back to the caller's own key space.
    ///
    /// A single-consume stream: each SCAN page is only fetched once the
    /// previous page has been yielded, so a caller that stops polling
    /// early never pays for pages it didn't ask for.
    pub fn keys<'a>(&'a self, user_pattern: &'a str) -> impl Stream<Item = CacheResult<String>> + 'a {
        let scoped_pattern = self.keys.scoped_pattern(user_pattern);
        async_stream::try_stream! {
            let mut cursor: u64 = 0;
            loop {
                let (next_cursor, page) = self.redis.scan(cursor, &scoped_pattern, SCAN_COUNT).await?;
                for scoped_key in page {
                    if let Some(user_key) = self.keys.unscope(&scoped_key) {
                        yield user_key.to_string();
                    }
                }
                cursor = next_cursor;
                if cursor == 0 {
                    break;
                }
            }
        }
    }

    /// Delete every remote key matching `user_pattern`, returning the
    /// count removed. Does not touch the local tier — callers combine
    /// this with invalidation-bus publication when a local-tier sweep
    /// is also required.
    pub async fn remove_by_pattern_on_redis_only(&self, user_pattern: &str) -> CacheResult<u64> {
        let scoped_pattern = self.keys.scoped_pattern(user_pattern);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next_cursor, page) = self.redis.scan(cursor, &scoped_pattern, SCAN_COUNT).await?;
            if !page.is_empty() {
                removed += self.redis.key_delete(&page).await?;
            }
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }

    /// Delete every remote key matching `user_pattern` in batches of up
    /// to `batch_size`, returning the removed count. Callers publish a
    /// single pattern-scoped invalidation message rather than one per
    /// removed key — enumerating potentially thousands of keys into one
    /// message would blow past the transport's size limit.
    ///
    /// For `flags.fire_and_forget`, delete commands are dispatched
    /// without awaiting per-batch acknowledgement; the returned count is
    /// still the number of keys dispatched rather than acknowledged.
    pub async fn remove_by_pattern(
        &self,
        user_pattern: &str,
        flags: CommandFlags,
        batch_size: usize,
    ) -> CacheResult<u64> {
        let scoped_pattern = self.keys.scoped_pattern(user_pattern);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next_cursor, page) = self.redis.scan(cursor, &scoped_pattern, SCAN_COUNT).await?;

            for batch in page.chunks(batch_size.max(1)) {
                if flags.fire_and_forget {
                    removed += self.redis.key_delete_fire_and_forget(batch.to_vec());
                } else {
                    removed += self.redis.key_delete(batch).await?;
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_pattern_prefixes_namespace() {
        let keys = KeyNamer::new("app");
        assert_eq!(keys.scoped_pattern("user:*"), "app:user:*");
    }

    #[test]
    fn scoped_pattern_matches_redis_glob_semantics() {
        use wildmatch::WildMatch;

        // wildmatch covers the `*`/`?` subset of Redis glob syntax that
        // this crate relies on for SCAN MATCH patterns.
        let keys = KeyNamer::new("app");
        let scoped = keys.scoped_pattern("TestRemove#*");
        let matcher = WildMatch::new(&scoped);

        assert!(matcher.matches("app:TestRemove#1"));
        assert!(matcher.matches("app:TestRemove#42"));
        assert!(!matcher.matches("app:noise#1"));
        assert!(!matcher.matches("other:TestRemove#1"));
    }
}
