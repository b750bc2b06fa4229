//! End-to-end scenarios against a live Redis instance.
//!
//! Run with: `cargo test -- --ignored` against `redis://localhost:6379`.

use std::time::Duration;

use hybrid_cache::{CommandFlags, HybridCache, HybridCacheEntryOptions, HybridCacheOptions, SetCondition};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Widget {
    id: i32,
    name: String,
}

fn unique_namespace(label: &str) -> String {
    format!("hybrid-cache-test-{label}-{}", Uuid::new_v4())
}

async fn new_cache(namespace: String) -> HybridCache {
    let options = HybridCacheOptions {
        instances_shared_name: namespace,
        redis_connect_string: "redis://localhost:6379".to_string(),
        abort_on_connect_fail: true,
        allow_admin: true,
        ..HybridCacheOptions::default()
    };
    HybridCache::new(options).await.unwrap()
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn cross_instance_invalidation_propagates_through_pubsub() {
    let namespace = unique_namespace("s1");
    let a = new_cache(namespace.clone()).await;
    let b = new_cache(namespace).await;

    a.set("x", &"v1".to_string(), HybridCacheEntryOptions::default())
        .await
        .unwrap();

    let seen: Option<String> = b.get("x").await.unwrap();
    assert_eq!(seen, Some("v1".to_string()));

    b.set("x", &"v2".to_string(), HybridCacheEntryOptions::default())
        .await
        .unwrap();
    sleep(Duration::from_secs(1)).await;

    let updated: Option<String> = a.get("x").await.unwrap();
    assert_eq!(updated, Some("v2".to_string()));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn local_ttl_is_bounded_by_remote_ttl() {
    let cache = new_cache(unique_namespace("s2")).await;

    let opts = HybridCacheEntryOptions::default()
        .with_local_expiry(Duration::from_secs(3600))
        .with_redis_expiry(Duration::from_secs(3));
    cache.set("k", &"v".to_string(), opts).await.unwrap();

    sleep(Duration::from_secs(4)).await;

    let value: Option<String> = cache.get("k").await.unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn conditional_write_rejects_when_key_exists() {
    let cache = new_cache(unique_namespace("s3")).await;

    let opts = HybridCacheEntryOptions::default().when(SetCondition::IfNotExists);

    let first = cache.set("k", &"a".to_string(), opts.clone()).await.unwrap();
    assert!(first);

    let second = cache.set("k", &"b".to_string(), opts).await.unwrap();
    assert!(!second);

    let value: Option<String> = cache.get("k").await.unwrap();
    assert_eq!(value, Some("a".to_string()));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn lock_lifecycle_acquire_contend_release() {
    let cache = new_cache(unique_namespace("s4")).await;
    let ttl = Duration::from_millis(500);

    let first = cache.try_lock("k", ttl).await.unwrap();
    assert!(first.is_some());

    let contended = cache.try_lock("k", ttl).await.unwrap();
    assert!(contended.is_none());

    sleep(Duration::from_millis(550)).await;

    let reacquired = cache.try_lock("k", Duration::from_secs(10)).await.unwrap();
    assert!(reacquired.is_some());
    let guard = reacquired.unwrap();

    assert!(guard.try_release().await.unwrap());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn lock_release_fails_for_non_owner_and_succeeds_for_owner() {
    let cache = new_cache(unique_namespace("s4b")).await;

    let guard = cache.try_lock("k", Duration::from_secs(10)).await.unwrap().unwrap();
    assert!(guard.is_held().await.unwrap());

    let second = cache.try_lock("k", Duration::from_secs(10)).await.unwrap();
    assert!(second.is_none());

    assert!(guard.try_release().await.unwrap());

    let third = cache.try_lock("k", Duration::from_secs(10)).await.unwrap();
    assert!(third.is_some());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn blocking_lock_waits_for_release_then_acquires() {
    let cache = new_cache(unique_namespace("s4c")).await;

    let guard = cache
        .try_lock("k", Duration::from_millis(300))
        .await
        .unwrap()
        .unwrap();

    let cancellation = CancellationToken::new();
    let waited = cache
        .lock_key("k", Duration::from_secs(5), Duration::from_secs(2), &cancellation)
        .await
        .unwrap();

    assert!(waited.is_some());
    drop(guard);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn remove_by_pattern_removes_matching_keys_only() {
    let cache = new_cache(unique_namespace("s5")).await;

    for i in 0..1000 {
        cache
            .set(&format!("TestRemoveWithPattern#{i}"), &i, HybridCacheEntryOptions::default())
            .await
            .unwrap();
    }
    for i in 0..1000 {
        cache
            .set(&format!("noise#{i}"), &i, HybridCacheEntryOptions::default())
            .await
            .unwrap();
    }

    let removed = cache
        .remove_by_pattern("[Tt]est[Rr]emove[Ww]ith[Pp]attern#*", CommandFlags::default())
        .await
        .unwrap();
    assert!(removed >= 1000);

    for i in 0..1000 {
        let value: Option<i32> = cache.get(&format!("TestRemoveWithPattern#{i}")).await.unwrap();
        assert_eq!(value, None);
    }
    for i in 0..1000 {
        let value: Option<i32> = cache.get(&format!("noise#{i}")).await.unwrap();
        assert_eq!(value, Some(i));
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn keep_ttl_preserves_existing_expiration_on_overwrite() {
    let cache = new_cache(unique_namespace("s6")).await;

    let first = HybridCacheEntryOptions::default().with_redis_expiry(Duration::from_secs(20));
    cache.set("k", &"v1".to_string(), first).await.unwrap();

    let second = HybridCacheEntryOptions::default()
        .with_redis_expiry(Duration::from_secs(300))
        .with_keep_ttl();
    cache.set("k", &"v2".to_string(), second).await.unwrap();

    let remaining = cache.get_expiration("k").await.unwrap();
    assert!(remaining.is_some());
    assert!(remaining.unwrap() <= Duration::from_secs(20));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn get_or_create_only_invokes_producer_on_miss() {
    let cache = new_cache(unique_namespace("s7")).await;

    let widget = Widget {
        id: 1,
        name: "gizmo".to_string(),
    };

    let first = cache
        .get_or_create("w", || async { Ok(widget.clone()) })
        .await
        .unwrap();
    assert_eq!(first, widget);

    let second = cache
        .get_or_create("w", || async { panic!("producer should not run on cache hit") })
        .await
        .unwrap();
    assert_eq!(second, widget);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn clear_all_requires_admin_enabled() {
    let options = HybridCacheOptions {
        instances_shared_name: unique_namespace("s8"),
        redis_connect_string: "redis://localhost:6379".to_string(),
        abort_on_connect_fail: true,
        allow_admin: false,
        ..HybridCacheOptions::default()
    };
    let cache = HybridCache::new(options).await.unwrap();
    assert!(cache.clear_all().await.is_err());
}
