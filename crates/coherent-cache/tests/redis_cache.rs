//! End-to-end tests against a real Redis.
//!
//! A Redis container is started once and shared by every test; each test
//! uses its own keys. Run with `cargo test -- --ignored` on a host with Docker.

use std::time::Duration;

use coherent_cache::{CacheConfig, CoherentCache, ListenerState, connect};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn node() -> CoherentCache {
    let mut config = CacheConfig::default();
    config.redis.url = get_redis_url().await;
    config.redis.pool_size = 4;
    config.listener.reconnect_delay_ms = 200;
    connect(&config).await.expect("connect to redis")
}

/// Waits for broadcasts to make the round trip through Redis.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_node_becomes_active() {
    let cache = node().await;
    assert_eq!(cache.listener_state(), ListenerState::Active);
    cache.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_write_invalidates_other_node() {
    let a = node().await;
    let b = node().await;

    a.set("it:profile", "v1".to_string()).await.unwrap();
    settle().await;
    assert_eq!(
        b.get::<String>("it:profile").await.unwrap().as_deref().map(String::as_str),
        Some("v1")
    );

    a.set("it:profile", "v2".to_string()).await.unwrap();
    settle().await;
    assert_eq!(
        b.get::<String>("it:profile").await.unwrap().as_deref().map(String::as_str),
        Some("v2")
    );

    assert_eq!(a.delete(&["it:profile"]).await.unwrap(), 1);
    settle().await;
    assert!(b.get::<String>("it:profile").await.unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_ttl_expires_local_copies() {
    let a = node().await;
    let b = node().await;

    a.set_with_ttl("it:session", 42u32, 1).await.unwrap();
    settle().await;
    assert_eq!(*b.get::<u32>("it:session").await.unwrap().unwrap(), 42);
    assert!(a.ttl("it:session").await.unwrap() > 0);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!b.local().contains_raw("it:session"));
    assert!(b.get::<u32>("it:session").await.unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_collections() {
    let a = node().await;
    let b = node().await;

    a.rpush("it:queue", &["one", "two"]).await.unwrap();
    a.zadd_multiple("it:board", &[(2.0, "bob"), (1.0, "alice")])
        .await
        .unwrap();
    a.hset("it:hash", "field", &7u32).await.unwrap();
    settle().await;

    assert_eq!(
        *b.lrange::<String>("it:queue", 0, -1).await.unwrap().unwrap(),
        vec!["one".to_string(), "two".to_string()]
    );
    assert_eq!(
        *b.zrevrange::<String>("it:board", 0, -1).await.unwrap().unwrap(),
        vec!["bob".to_string(), "alice".to_string()]
    );
    assert_eq!(*b.hget::<str, u32>("it:hash", "field").await.unwrap().unwrap(), 7);

    assert_eq!(a.lpop::<String>("it:queue").await.unwrap().as_deref(), Some("one"));
    settle().await;
    assert_eq!(b.lrange::<String>("it:queue", 0, -1).await.unwrap().unwrap().len(), 1);

    a.delete(&["it:queue", "it:board", "it:hash"]).await.unwrap();
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_application_pubsub() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    let a = node().await;
    let b = node().await;
    let received = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&received);
    b.subscribe("it:events", move |n: u32| {
        seen.store(n, Ordering::SeqCst);
    })
    .await
    .unwrap();

    a.publish("it:events", &5u32).await.unwrap();
    settle().await;
    assert_eq!(received.load(Ordering::SeqCst), 5);

    a.shutdown().await;
    b.shutdown().await;
}
