//! Coherent local cache in front of a shared Redis store.
//!
//! Each node keeps decoded values in process memory and reads through to
//! Redis on a miss. Writes go to Redis first and are then broadcast on a
//! pub/sub channel so every other node drops its local copy.
//!
//! ```no_run
//! # async fn run() -> Result<(), coherent_cache::CacheError> {
//! let config = coherent_cache::config::loader::load_config(None)
//!     .map_err(coherent_cache::CacheError::Config)?;
//! let cache = coherent_cache::connect(&config).await?;
//!
//! cache.set("greeting", "hello".to_string()).await?;
//! let greeting = cache.get::<String>("greeting").await?;
//! assert_eq!(greeting.as_deref().map(String::as_str), Some("hello"));
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod pubsub;

use std::sync::Arc;

pub use backend::{BackingStore, MemoryStore, PubSubTransport, RedisPubSubTransport, RedisStore};
pub use cache::{CoherentCache, CoherentCacheBuilder, InvalidationCoordinator, LocalCacheStore};
pub use codec::{CacheValue, Codec, TypeDescriptor};
pub use config::CacheConfig;
pub use error::{CacheError, CodecError, StoreError};
pub use observability::init_tracing;
pub use pubsub::{ListenerState, SubscriberId, SubscriptionListener};

/// Connect a cache node to the Redis instance described by `config`.
///
/// The pool is created eagerly but an unreachable server is not fatal: reads
/// miss, writes fail, and the subscription listener keeps retrying until
/// Redis comes back.
///
/// Also installs a fmt subscriber at `config.logging.level` unless the host
/// already installed one.
pub async fn connect(config: &CacheConfig) -> Result<CoherentCache, CacheError> {
    config.validate().map_err(CacheError::Config)?;
    observability::init_tracing_from_config(&config.logging);

    tracing::info!(url = %config.redis.url, "Connecting to Redis");

    let timeout = Some(config.redis.timeout());
    let mut pool_config = deadpool_redis::PoolConfig::new(config.redis.pool_size);
    pool_config.timeouts.wait = timeout;
    pool_config.timeouts.create = timeout;
    pool_config.timeouts.recycle = timeout;

    let mut redis_config = deadpool_redis::Config::from_url(&config.redis.url);
    redis_config.pool = Some(pool_config);

    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| CacheError::Config(format!("failed to create Redis pool: {e}")))?;

    let store = RedisStore::new(pool);
    if store.is_available().await {
        tracing::info!("Connected to Redis");
    } else {
        tracing::warn!(
            url = %config.redis.url,
            "Redis not reachable, cache will serve local entries only until it is"
        );
    }

    let transport = RedisPubSubTransport::open(&config.redis.url)
        .map_err(|e| CacheError::Config(e.to_string()))?;

    CoherentCache::builder()
        .with_store(Arc::new(store))
        .with_transport(Arc::new(transport))
        .with_config(config.clone())
        .build()
        .await
}
