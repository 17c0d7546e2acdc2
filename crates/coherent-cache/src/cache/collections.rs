//! Hash, set, sorted-set and list operations.
//!
//! Reads that return a decoded collection (or one element of it) are cached
//! as typed views under composite keys:
//!
//! ```text
//! <key>:hash:field:<hex field>:<type>
//! <key>:hash:entries:<type>
//! <key>:set:members:<type>
//! <key>:zset:range:<start>:<stop>:<type>      (revrange for descending)
//! <key>:list:range:<start>:<stop>:<type>
//! <key>:list:index:<index>:<type>
//! ```
//!
//! A mutation drops every view of its collection kind with one prefix
//! invalidation (`<key>:set:` ...) and broadcasts the base key, so remote
//! nodes drop every view derived from it. Counts, scores, ranks and
//! membership tests are not cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use super::facade::CoherentCache;
use super::local::{CompositeKey, HASH, LIST, SET, ZSET};
use crate::backend::ListEnd;
use crate::codec::{CacheValue, TypeDescriptor};
use crate::error::CacheError;
use crate::metrics;

impl CoherentCache {
    // ==================== Hash ====================

    /// Set a hash field. Returns `true` if the field is new.
    pub async fn hset<F, V>(&self, key: &str, field: &F, value: &V) -> Result<bool, CacheError>
    where
        F: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let field = self.codec.encode(field)?;
        let value = self.codec.encode(value)?;
        let created = self.store.hset(key, &field, &value).await?;
        self.collection_changed(key, HASH).await;
        Ok(created)
    }

    pub async fn hget<F, V>(&self, key: &str, field: &F) -> Result<Option<Arc<V>>, CacheError>
    where
        F: Serialize + ?Sized,
        V: CacheValue,
    {
        self.ensure_open()?;
        let field = self.codec.encode(field)?;
        let view = CompositeKey::new(key)
            .push(HASH)
            .push("field")
            .push(hex::encode(&field))
            .typed(&TypeDescriptor::of::<V>());

        self.cached_view(key, view, || async {
            match self.store.hget(key, &field).await? {
                Some(bytes) => Ok::<_, CacheError>(Some(self.codec.decode::<V>(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// All fields of a hash; an empty map if the hash does not exist.
    pub async fn hget_all<F, V>(&self, key: &str) -> Result<Option<Arc<HashMap<F, V>>>, CacheError>
    where
        F: CacheValue + Eq + Hash,
        V: CacheValue,
    {
        self.ensure_open()?;
        let view = CompositeKey::new(key)
            .push(HASH)
            .push("entries")
            .typed(&TypeDescriptor::of::<HashMap<F, V>>());

        self.cached_view(key, view, || async {
            let entries = self.store.hgetall(key).await?;
            let mut map = HashMap::with_capacity(entries.len());
            for (field, value) in entries {
                map.insert(
                    self.codec.decode::<F>(&field)?,
                    self.codec.decode::<V>(&value)?,
                );
            }
            Ok::<_, CacheError>(Some(map))
        })
        .await
    }

    pub async fn hdel<F: Serialize>(&self, key: &str, fields: &[F]) -> Result<u64, CacheError> {
        self.ensure_open()?;
        let fields = self.codec.encode_all(fields)?;
        let removed = self.store.hdel(key, &fields).await?;
        if removed > 0 {
            self.collection_changed(key, HASH).await;
        }
        Ok(removed)
    }

    pub async fn hexists<F>(&self, key: &str, field: &F) -> Result<bool, CacheError>
    where
        F: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let field = self.codec.encode(field)?;
        Ok(self.store.hexists(key, &field).await?)
    }

    pub async fn hlen(&self, key: &str) -> Result<u64, CacheError> {
        self.ensure_open()?;
        Ok(self.store.hlen(key).await?)
    }

    // ==================== Set ====================

    /// Add members. Returns how many were not already present.
    pub async fn sadd<T: Serialize>(&self, key: &str, members: &[T]) -> Result<u64, CacheError> {
        self.ensure_open()?;
        let members = self.codec.encode_all(members)?;
        let added = self.store.sadd(key, &members).await?;
        if added > 0 {
            self.collection_changed(key, SET).await;
        }
        Ok(added)
    }

    pub async fn srem<T: Serialize>(&self, key: &str, members: &[T]) -> Result<u64, CacheError> {
        self.ensure_open()?;
        let members = self.codec.encode_all(members)?;
        let removed = self.store.srem(key, &members).await?;
        if removed > 0 {
            self.collection_changed(key, SET).await;
        }
        Ok(removed)
    }

    /// All members, in no particular order.
    pub async fn smembers<T: CacheValue>(
        &self,
        key: &str,
    ) -> Result<Option<Arc<Vec<T>>>, CacheError> {
        self.ensure_open()?;
        let view = CompositeKey::new(key)
            .push(SET)
            .push("members")
            .typed(&TypeDescriptor::of::<Vec<T>>());

        self.cached_view(key, view, || async {
            let members = self.store.smembers(key).await?;
            Ok::<_, CacheError>(Some(self.decode_all::<T>(&members)?))
        })
        .await
    }

    pub async fn sismember<T>(&self, key: &str, member: &T) -> Result<bool, CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let member = self.codec.encode(member)?;
        Ok(self.store.sismember(key, &member).await?)
    }

    pub async fn scard(&self, key: &str) -> Result<u64, CacheError> {
        self.ensure_open()?;
        Ok(self.store.scard(key).await?)
    }

    // ==================== Sorted Set ====================

    /// Add a member or update its score. Returns `true` if the member is new.
    pub async fn zadd<T>(&self, key: &str, member: &T, score: f64) -> Result<bool, CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let member = self.codec.encode(member)?;
        let added = self.store.zadd(key, &[(score, member)]).await?;
        self.collection_changed(key, ZSET).await;
        Ok(added > 0)
    }

    pub async fn zadd_multiple<T: Serialize>(
        &self,
        key: &str,
        members: &[(f64, T)],
    ) -> Result<u64, CacheError> {
        self.ensure_open()?;
        if members.is_empty() {
            return Ok(0);
        }
        let members = members
            .iter()
            .map(|(score, member)| -> Result<(f64, Vec<u8>), CacheError> {
                Ok((*score, self.codec.encode(member)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let added = self.store.zadd(key, &members).await?;
        self.collection_changed(key, ZSET).await;
        Ok(added)
    }

    /// Members by ascending score between ranks `start` and `stop` (inclusive).
    pub async fn zrange<T: CacheValue>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Option<Arc<Vec<T>>>, CacheError> {
        self.zrange_view(key, start, stop, false).await
    }

    /// Members by descending score between ranks `start` and `stop` (inclusive).
    pub async fn zrevrange<T: CacheValue>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Option<Arc<Vec<T>>>, CacheError> {
        self.zrange_view(key, start, stop, true).await
    }

    async fn zrange_view<T: CacheValue>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Option<Arc<Vec<T>>>, CacheError> {
        self.ensure_open()?;
        let view = CompositeKey::new(key)
            .push(ZSET)
            .push(if reverse { "revrange" } else { "range" })
            .push(start)
            .push(stop)
            .typed(&TypeDescriptor::of::<Vec<T>>());

        self.cached_view(key, view, || async {
            let members = self.store.zrange(key, start, stop, reverse).await?;
            Ok::<_, CacheError>(Some(self.decode_all::<T>(&members)?))
        })
        .await
    }

    pub async fn zrem<T: Serialize>(&self, key: &str, members: &[T]) -> Result<u64, CacheError> {
        self.ensure_open()?;
        let members = self.codec.encode_all(members)?;
        let removed = self.store.zrem(key, &members).await?;
        if removed > 0 {
            self.collection_changed(key, ZSET).await;
        }
        Ok(removed)
    }

    pub async fn zscore<T>(&self, key: &str, member: &T) -> Result<Option<f64>, CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let member = self.codec.encode(member)?;
        Ok(self.store.zscore(key, &member).await?)
    }

    pub async fn zrank<T>(&self, key: &str, member: &T) -> Result<Option<u64>, CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let member = self.codec.encode(member)?;
        Ok(self.store.zrank(key, &member, false).await?)
    }

    pub async fn zrevrank<T>(&self, key: &str, member: &T) -> Result<Option<u64>, CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let member = self.codec.encode(member)?;
        Ok(self.store.zrank(key, &member, true).await?)
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, CacheError> {
        self.ensure_open()?;
        Ok(self.store.zcard(key).await?)
    }

    // ==================== List ====================

    /// Push values to the head, in argument order. Returns the new length.
    pub async fn lpush<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64, CacheError> {
        self.push(key, values, ListEnd::Head).await
    }

    /// Push values to the tail, in argument order. Returns the new length.
    pub async fn rpush<T: Serialize>(&self, key: &str, values: &[T]) -> Result<u64, CacheError> {
        self.push(key, values, ListEnd::Tail).await
    }

    async fn push<T: Serialize>(
        &self,
        key: &str,
        values: &[T],
        end: ListEnd,
    ) -> Result<u64, CacheError> {
        self.ensure_open()?;
        let values = self.codec.encode_all(values)?;
        let len = self.store.push(key, &values, end).await?;
        if !values.is_empty() {
            self.collection_changed(key, LIST).await;
        }
        Ok(len)
    }

    /// Remove and return the head element.
    ///
    /// The element is gone from the store even if it cannot be decoded, so a
    /// decode failure is returned as an error rather than a miss.
    pub async fn lpop<T: CacheValue>(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.pop(key, ListEnd::Head).await
    }

    /// Remove and return the tail element.
    pub async fn rpop<T: CacheValue>(&self, key: &str) -> Result<Option<T>, CacheError> {
        self.pop(key, ListEnd::Tail).await
    }

    async fn pop<T: CacheValue>(&self, key: &str, end: ListEnd) -> Result<Option<T>, CacheError> {
        self.ensure_open()?;
        let Some(bytes) = self.store.pop(key, end).await? else {
            return Ok(None);
        };
        self.collection_changed(key, LIST).await;
        Ok(Some(self.codec.decode::<T>(&bytes)?))
    }

    pub async fn lrange<T: CacheValue>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Option<Arc<Vec<T>>>, CacheError> {
        self.ensure_open()?;
        let view = CompositeKey::new(key)
            .push(LIST)
            .push("range")
            .push(start)
            .push(stop)
            .typed(&TypeDescriptor::of::<Vec<T>>());

        self.cached_view(key, view, || async {
            let values = self.store.lrange(key, start, stop).await?;
            Ok::<_, CacheError>(Some(self.decode_all::<T>(&values)?))
        })
        .await
    }

    pub async fn lindex<T: CacheValue>(
        &self,
        key: &str,
        index: i64,
    ) -> Result<Option<Arc<T>>, CacheError> {
        self.ensure_open()?;
        let view = CompositeKey::new(key)
            .push(LIST)
            .push("index")
            .push(index)
            .typed(&TypeDescriptor::of::<T>());

        self.cached_view(key, view, || async {
            match self.store.lindex(key, index).await? {
                Some(bytes) => Ok::<_, CacheError>(Some(self.codec.decode::<T>(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn lset<T>(&self, key: &str, index: i64, value: &T) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let value = self.codec.encode(value)?;
        self.store.lset(key, index, &value).await?;
        self.collection_changed(key, LIST).await;
        Ok(())
    }

    pub async fn llen(&self, key: &str) -> Result<u64, CacheError> {
        self.ensure_open()?;
        Ok(self.store.llen(key).await?)
    }

    // ==================== Helpers ====================

    /// Serves `view` from the local cache, or loads and caches it.
    ///
    /// Load failures (transport or decode) are logged and reported as a miss;
    /// absent results are not cached.
    async fn cached_view<V, L, Fut>(
        &self,
        key: &str,
        view: CompositeKey,
        load: L,
    ) -> Result<Option<Arc<V>>, CacheError>
    where
        V: Send + Sync + 'static,
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, CacheError>>,
    {
        if let Some(slot) = self.local.get_typed(&view) {
            return match slot.downcast::<V>() {
                Ok(value) => {
                    metrics::record_cache_hit("local");
                    Ok(Some(value))
                }
                Err(found) => Err(CacheError::type_mismatch(
                    key,
                    std::any::type_name::<V>(),
                    found.name(),
                )),
            };
        }

        let generation = self.local.generation();
        match load().await {
            Ok(Some(value)) => {
                let value = Arc::new(value);
                self.local.put_typed(&view, Arc::clone(&value));
                if self.local.generation() != generation {
                    self.local.remove_typed(&view);
                }
                metrics::record_cache_hit("store");
                Ok(Some(value))
            }
            Ok(None) => {
                metrics::record_cache_miss();
                Ok(None)
            }
            Err(e) => {
                warn!(key = %key, view = %view, error = %e, "Collection read failed, treating as miss");
                metrics::record_cache_miss();
                Ok(None)
            }
        }
    }

    /// Drops the local views of one collection kind and tells other nodes
    /// to drop every view of `key`.
    async fn collection_changed(&self, key: &str, kind: &str) {
        self.local
            .invalidate_by_prefix(&CompositeKey::view_prefix(key, kind));
        self.coordinator.publish_invalidation(key).await;
    }

    fn decode_all<T: CacheValue>(&self, items: &[Vec<u8>]) -> Result<Vec<T>, CacheError> {
        items
            .iter()
            .map(|item| self.codec.decode::<T>(item).map_err(CacheError::from))
            .collect()
    }
}
