//! Collection operations and their cached views across nodes.

use std::collections::HashMap;
use std::time::Duration;

use coherent_cache::cache::CompositeKey;
use coherent_cache::{BackingStore, CacheError, CoherentCache, MemoryStore, TypeDescriptor};

async fn node(store: &MemoryStore) -> CoherentCache {
    CoherentCache::builder()
        .with_memory_store(store)
        .build()
        .await
        .expect("node should start")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn hash_views_follow_remote_writes() {
    let store = MemoryStore::new();
    let a = node(&store).await;
    let b = node(&store).await;

    assert!(a.hset("user:1", "name", "ada").await.unwrap());
    assert!(a.hset("user:1", "lang", "en").await.unwrap());
    assert!(!a.hset("user:1", "lang", "fr").await.unwrap());
    settle().await;

    let name = b.hget::<str, String>("user:1", "name").await.unwrap().unwrap();
    assert_eq!(name.as_str(), "ada");
    let all = b
        .hget_all::<String, String>("user:1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(all.get("lang").map(String::as_str), Some("fr"));
    let field_view = CompositeKey::new("user:1")
        .push("hash")
        .push("field")
        .push(hex::encode(b"\"name\""))
        .typed(&TypeDescriptor::of::<String>());
    assert!(b.local().contains_typed(field_view.as_str()));

    assert_eq!(a.hdel("user:1", &["name"]).await.unwrap(), 1);
    assert_eq!(a.hdel("user:1", &["name"]).await.unwrap(), 0);
    settle().await;
    assert!(b.hget::<str, String>("user:1", "name").await.unwrap().is_none());
    assert!(!b.hexists("user:1", "name").await.unwrap());
    assert_eq!(b.hlen("user:1").await.unwrap(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_hash_reads_as_empty_map() {
    let store = MemoryStore::new();
    let a = node(&store).await;

    let all = a.hget_all::<String, u32>("nothing").await.unwrap().unwrap();
    assert_eq!(*all, HashMap::new());
    assert!(a.hget::<str, u32>("nothing", "f").await.unwrap().is_none());

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn set_mutation_only_drops_set_views_locally() {
    let store = MemoryStore::new();
    // Node without a subscription so its own broadcasts do not come back.
    let a = CoherentCache::builder()
        .with_store(std::sync::Arc::new(store.clone()))
        .with_transport(std::sync::Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap();

    a.sadd("tags", &["red", "blue"]).await.unwrap();
    a.rpush("tags:log", &["x"]).await.unwrap();
    let mut members = (*a.smembers::<String>("tags").await.unwrap().unwrap()).clone();
    members.sort();
    assert_eq!(members, vec!["blue".to_string(), "red".to_string()]);
    assert!(a.lrange::<String>("tags:log", 0, -1).await.unwrap().is_some());

    let members_view = CompositeKey::new("tags")
        .push("set")
        .push("members")
        .typed(&TypeDescriptor::of::<Vec<String>>());
    let log_view = CompositeKey::new("tags:log")
        .push("list")
        .push("range")
        .push(0)
        .push(-1)
        .typed(&TypeDescriptor::of::<Vec<String>>());

    assert_eq!(a.sadd("tags", &["red"]).await.unwrap(), 0);
    assert!(a.local().contains_typed(members_view.as_str()));

    assert_eq!(a.sadd("tags", &["green"]).await.unwrap(), 1);
    assert!(!a.local().contains_typed(members_view.as_str()));
    assert!(a.local().contains_typed(log_view.as_str()));
    assert_eq!(a.smembers::<String>("tags").await.unwrap().unwrap().len(), 3);
    assert!(a.sismember("tags", "green").await.unwrap());
    assert_eq!(a.srem("tags", &["green", "purple"]).await.unwrap(), 1);
    assert_eq!(a.scard("tags").await.unwrap(), 2);

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sorted_set_ranges_are_cached_per_range() {
    let store = MemoryStore::new();
    let a = node(&store).await;
    let b = node(&store).await;

    a.zadd_multiple("board", &[(30.0, "carol"), (10.0, "alice"), (20.0, "bob")])
        .await
        .unwrap();
    settle().await;

    let top = b.zrevrange::<String>("board", 0, 1).await.unwrap().unwrap();
    assert_eq!(*top, vec!["carol".to_string(), "bob".to_string()]);
    let all = b.zrange::<String>("board", 0, -1).await.unwrap().unwrap();
    assert_eq!(*all, vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]);
    assert_eq!(b.zscore("board", "bob").await.unwrap(), Some(20.0));
    assert_eq!(b.zrank("board", "carol").await.unwrap(), Some(2));
    assert_eq!(b.zrevrank("board", "carol").await.unwrap(), Some(0));

    assert!(!a.zadd("board", "alice", 40.0).await.unwrap());
    settle().await;
    let top = b.zrevrange::<String>("board", 0, 0).await.unwrap().unwrap();
    assert_eq!(*top, vec!["alice".to_string()]);
    assert_eq!(b.zcard("board").await.unwrap(), 3);

    assert_eq!(a.zrem("board", &["bob"]).await.unwrap(), 1);
    settle().await;
    assert_eq!(b.zrange::<String>("board", 0, -1).await.unwrap().unwrap().len(), 2);
    assert_eq!(b.zrank("board", "bob").await.unwrap(), None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn list_views_follow_pushes_and_pops() {
    let store = MemoryStore::new();
    let a = node(&store).await;
    let b = node(&store).await;

    assert_eq!(a.rpush("queue", &[1u32, 2, 3]).await.unwrap(), 3);
    assert_eq!(a.lpush("queue", &[0u32]).await.unwrap(), 4);
    settle().await;

    assert_eq!(*b.lrange::<u32>("queue", 0, -1).await.unwrap().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(*b.lindex::<u32>("queue", -1).await.unwrap().unwrap(), 3);

    assert_eq!(a.lpop::<u32>("queue").await.unwrap(), Some(0));
    assert_eq!(a.rpop::<u32>("queue").await.unwrap(), Some(3));
    a.lset("queue", 0, &10u32).await.unwrap();
    settle().await;

    assert_eq!(*b.lrange::<u32>("queue", 0, -1).await.unwrap().unwrap(), vec![10, 2]);
    assert_eq!(*b.lindex::<u32>("queue", -1).await.unwrap().unwrap(), 2);
    assert!(b.lindex::<u32>("queue", 5).await.unwrap().is_none());
    assert_eq!(b.llen("queue").await.unwrap(), 2);

    assert!(a.lset("queue", 9, &0u32).await.is_err());
    assert_eq!(a.lpop::<u32>("empty").await.unwrap(), None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn undecodable_pop_is_an_error_and_still_removed() {
    let store = MemoryStore::new();
    let a = node(&store).await;

    a.rpush("mixed", &["text"]).await.unwrap();
    let err = a.lpop::<u32>("mixed").await.unwrap_err();
    assert!(matches!(err, CacheError::Codec(_)));
    assert_eq!(store.llen("mixed").await.unwrap(), 0);

    a.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn collection_reads_miss_while_the_store_is_down() {
    let store = MemoryStore::new();
    let a = node(&store).await;
    a.sadd("s", &[1u8]).await.unwrap();
    settle().await;

    store.set_available(false);
    assert!(a.smembers::<u8>("s").await.unwrap().is_none());
    assert!(matches!(a.sadd("s", &[2u8]).await, Err(CacheError::Store(_))));

    store.set_available(true);
    assert_eq!(*a.smembers::<u8>("s").await.unwrap().unwrap(), vec![1]);

    a.shutdown().await;
}
