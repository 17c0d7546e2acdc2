//! Backing store and pub/sub transport contracts.
//!
//! The cache never talks to Redis directly; it goes through these traits so
//! the same coordinator runs against [`RedisStore`] in production and
//! [`MemoryStore`] in tests or single-process deployments.
//!
//! All values cross this boundary as opaque bytes. Encoding is the caller's
//! job (see [`Codec`](crate::codec::Codec)).

pub mod memory;
pub mod redis;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::pubsub::BusError;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisPubSubTransport, RedisStore};

/// Which end of a list a push or pop operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    Head,
    Tail,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// The shared remote key-value store all nodes read and write through.
///
/// Implementations must be thread-safe; one instance is shared by every
/// caller task of a node.
#[async_trait]
pub trait BackingStore: Send + Sync {
    // ==================== Key / Value ====================

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn set_with_expiry(&self, key: &str, value: &[u8], seconds: u64)
    -> Result<(), StoreError>;

    /// Deletes the given keys and returns how many existed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Sets a timeout on `key`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError>;

    /// Remaining time to live in seconds; `-2` if missing, `-1` if persistent.
    async fn ttl(&self, key: &str) -> Result<i64, StoreError>;

    /// Removes every key of the store.
    async fn flush_all(&self) -> Result<(), StoreError>;

    /// Publishes a message; fire-and-forget, no delivery acknowledgement.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError>;

    // ==================== Hash ====================

    /// Returns `true` if the field was newly created.
    async fn hset(&self, key: &str, field: &[u8], value: &[u8]) -> Result<bool, StoreError>;

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    async fn hdel(&self, key: &str, fields: &[Vec<u8>]) -> Result<u64, StoreError>;

    async fn hexists(&self, key: &str, field: &[u8]) -> Result<bool, StoreError>;

    async fn hlen(&self, key: &str) -> Result<u64, StoreError>;

    // ==================== Set ====================

    async fn sadd(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError>;

    async fn srem(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn sismember(&self, key: &str, member: &[u8]) -> Result<bool, StoreError>;

    async fn scard(&self, key: &str) -> Result<u64, StoreError>;

    // ==================== Sorted Set ====================

    /// Adds or updates `(score, member)` pairs; returns the number of new members.
    async fn zadd(&self, key: &str, members: &[(f64, Vec<u8>)]) -> Result<u64, StoreError>;

    /// Members between rank `start` and `stop` (inclusive, negative counts from the end).
    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn zrem(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError>;

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<f64>, StoreError>;

    async fn zrank(&self, key: &str, member: &[u8], reverse: bool)
    -> Result<Option<u64>, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    // ==================== List ====================

    /// Pushes values in order and returns the new list length.
    async fn push(&self, key: &str, values: &[Vec<u8>], end: ListEnd) -> Result<u64, StoreError>;

    async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<Vec<u8>>, StoreError>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn llen(&self, key: &str) -> Result<u64, StoreError>;

    async fn lset(&self, key: &str, index: i64, value: &[u8]) -> Result<(), StoreError>;

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Opens dedicated subscription connections.
///
/// A subscribed connection cannot serve ordinary commands, so this is kept
/// apart from the request pool behind [`BackingStore`].
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SubscriptionConnection>, BusError>;
}

/// One live subscription connection.
///
/// Channel changes are applied in place; the connection is only dropped on
/// shutdown, when its channel set becomes empty, or after a transport failure.
#[async_trait]
pub trait SubscriptionConnection: Send {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BusError>;

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), BusError>;

    /// Waits for the next message. `None` means the stream closed.
    async fn next_message(&mut self) -> Option<BusMessage>;
}

/// Resolves a Redis-style inclusive `[start, stop]` range against `len`.
///
/// Returns the half-open index range, or `None` when it selects nothing.
pub(crate) fn resolve_range(len: usize, start: i64, stop: i64) -> Option<std::ops::Range<usize>> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some(start as usize..stop as usize + 1)
}
