//! Redis implementation of the backing store and pub/sub transport.
//!
//! Request/response commands go through a `deadpool_redis` pool shared by all
//! caller tasks. Subscriptions use a separate client, because a connection in
//! SUBSCRIBE mode cannot serve ordinary commands.

use async_trait::async_trait;
use deadpool_redis::redis::aio::{PubSubSink, PubSubStream};
use deadpool_redis::redis::{self, AsyncCommands, Client};
use deadpool_redis::{Connection, Pool};
use futures_util::StreamExt;

use super::{BackingStore, BusMessage, ListEnd, PubSubTransport, SubscriptionConnection};
use crate::error::StoreError;
use crate::pubsub::BusError;

/// [`BackingStore`] over a pooled Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Check if Redis is reachable (for health checks).
    pub async fn is_available(&self) -> bool {
        match self.pool.get().await {
            Ok(mut conn) => {
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                pong.is_ok()
            }
            Err(_) => false,
        }
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl BackingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        seconds: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let applied: bool = conn.expire(key, seconds as i64).await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let ttl: i64 = conn.ttl(key).await?;
        Ok(ttl)
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let added: u64 = conn.hset(key, field, value).await?;
        Ok(added > 0)
    }

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut conn = self.connection().await?;
        let entries: std::collections::HashMap<Vec<u8>, Vec<u8>> = conn.hgetall(key).await?;
        Ok(entries.into_iter().collect())
    }

    async fn hdel(&self, key: &str, fields: &[Vec<u8>]) -> Result<u64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = conn.hdel(key, fields).await?;
        Ok(removed)
    }

    async fn hexists(&self, key: &str, field: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let exists: bool = conn.hexists(key, field).await?;
        Ok(exists)
    }

    async fn hlen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.hlen(key).await?;
        Ok(len)
    }

    async fn sadd(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let added: u64 = conn.sadd(key, members).await?;
        Ok(added)
    }

    async fn srem(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = conn.srem(key, members).await?;
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let members: Vec<Vec<u8>> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let is_member: bool = conn.sismember(key, member).await?;
        Ok(is_member)
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let card: u64 = conn.scard(key).await?;
        Ok(card)
    }

    async fn zadd(&self, key: &str, members: &[(f64, Vec<u8>)]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let added: u64 = conn.zadd_multiple(key, members).await?;
        Ok(added)
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let members: Vec<Vec<u8>> = if reverse {
            conn.zrevrange(key, start as isize, stop as isize).await?
        } else {
            conn.zrange(key, start as isize, stop as isize).await?
        };
        Ok(members)
    }

    async fn zrem(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let removed: u64 = conn.zrem(key, members).await?;
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<f64>, StoreError> {
        let mut conn = self.connection().await?;
        let score: Option<f64> = conn.zscore(key, member).await?;
        Ok(score)
    }

    async fn zrank(
        &self,
        key: &str,
        member: &[u8],
        reverse: bool,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection().await?;
        let rank: Option<u64> = if reverse {
            conn.zrevrank(key, member).await?
        } else {
            conn.zrank(key, member).await?
        };
        Ok(rank)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let card: u64 = conn.zcard(key).await?;
        Ok(card)
    }

    async fn push(&self, key: &str, values: &[Vec<u8>], end: ListEnd) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        if values.is_empty() {
            let len: u64 = conn.llen(key).await?;
            return Ok(len);
        }
        let len: u64 = match end {
            ListEnd::Head => conn.lpush(key, values).await?,
            ListEnd::Tail => conn.rpush(key, values).await?,
        };
        Ok(len)
    }

    async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = match end {
            ListEnd::Head => conn.lpop(key, None).await?,
            ListEnd::Tail => conn.rpop(key, None).await?,
        };
        Ok(value)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let values: Vec<Vec<u8>> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(values)
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn lset(&self, key: &str, index: i64, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.lset(key, index as isize, value).await?;
        Ok(())
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.lindex(key, index as isize).await?;
        Ok(value)
    }
}

/// [`PubSubTransport`] that opens a dedicated Redis client connection per subscription.
pub struct RedisPubSubTransport {
    client: Client,
}

impl RedisPubSubTransport {
    /// Creates the transport; no connection is made until [`connect`](PubSubTransport::connect).
    pub fn open(redis_url: &str) -> Result<Self, BusError> {
        let client = Client::open(redis_url).map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PubSubTransport for RedisPubSubTransport {
    async fn connect(&self) -> Result<Box<dyn SubscriptionConnection>, BusError> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        // The sink changes subscriptions while the stream keeps delivering messages.
        let (sink, stream) = pubsub.split();
        Ok(Box::new(RedisSubscription { sink, stream }))
    }
}

struct RedisSubscription {
    sink: PubSubSink,
    stream: PubSubStream,
}

#[async_trait]
impl SubscriptionConnection for RedisSubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BusError> {
        self.sink
            .subscribe(channel)
            .await
            .map_err(|e| BusError::subscribe(channel, e.to_string()))
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), BusError> {
        self.sink
            .unsubscribe(channel)
            .await
            .map_err(|e| BusError::unsubscribe(channel, e.to_string()))
    }

    async fn next_message(&mut self) -> Option<BusMessage> {
        let msg = self.stream.next().await?;
        Some(BusMessage {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        })
    }
}
