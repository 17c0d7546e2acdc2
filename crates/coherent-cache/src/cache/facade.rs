//! The node-visible cache entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::coordinator::InvalidationCoordinator;
use super::local::{CompositeKey, LocalCacheStore};
use crate::backend::{BackingStore, MemoryStore, PubSubTransport};
use crate::codec::{CacheValue, Codec, TypeDescriptor};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::metrics::{self, InvalidationSource, PublishKind};
use crate::pubsub::{
    ChannelNames, InvalidationBus, ListenerState, MessageHandler, SubscriberId,
    SubscriptionListener,
};

/// Read-through, write-through cache with a coherent local tier.
///
/// ## Lookup order
///
/// ```text
/// get(key) → typed slot → raw slot (decode) → backing store (decode, populate) → None
/// ```
///
/// Writes go to the backing store first; the local tier is only populated
/// once the store accepted the write. Every write and delete is broadcast so
/// other nodes drop their local copies.
///
/// Cloning is cheap and every clone shares the same node state.
#[derive(Clone)]
pub struct CoherentCache {
    pub(super) store: Arc<dyn BackingStore>,
    pub(super) local: Arc<LocalCacheStore>,
    pub(super) coordinator: Arc<InvalidationCoordinator>,
    pub(super) listener: Arc<SubscriptionListener>,
    pub(super) codec: Codec,
    closed: Arc<AtomicBool>,
}

impl CoherentCache {
    pub fn builder() -> CoherentCacheBuilder {
        CoherentCacheBuilder::new()
    }

    /// Get a value.
    ///
    /// A miss, a transport failure and an undecodable payload all return
    /// `Ok(None)`. Asking for a different type than the one this node cached
    /// the key under is an error.
    pub async fn get<T: CacheValue>(&self, key: &str) -> Result<Option<Arc<T>>, CacheError> {
        self.ensure_open()?;
        let descriptor = TypeDescriptor::of::<T>();
        let typed_key = CompositeKey::new(key).typed(&descriptor);

        // 1. Typed slot
        if let Some(slot) = self.local.get_typed(&typed_key) {
            return match slot.downcast::<T>() {
                Ok(value) => {
                    metrics::record_cache_hit("local");
                    Ok(Some(value))
                }
                Err(found) => Err(CacheError::type_mismatch(key, descriptor.name(), found.name())),
            };
        }

        // 2. Raw slot
        if let Some(raw) = self.local.get_raw(key) {
            match raw.origin {
                Some(origin) if origin != descriptor => {
                    return Err(CacheError::type_mismatch(key, descriptor.name(), origin.name()));
                }
                _ => {}
            }
            return match self.codec.decode::<T>(&raw.payload) {
                Ok(value) => {
                    let value = Arc::new(value);
                    self.local.put_typed(&typed_key, Arc::clone(&value));
                    metrics::record_cache_hit("local");
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached payload not decodable, treating as miss");
                    metrics::record_cache_miss();
                    Ok(None)
                }
            };
        }

        // 3. Backing store
        let generation = self.local.generation();
        let payload = match self.store.get(key).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                metrics::record_cache_miss();
                return Ok(None);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Backing store read failed, treating as miss");
                metrics::record_cache_miss();
                return Ok(None);
            }
        };

        let value = match self.codec.decode::<T>(&payload) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Stored payload not decodable, treating as miss");
                metrics::record_cache_miss();
                return Ok(None);
            }
        };

        self.local
            .put_raw_with_origin(key, payload, Some(descriptor));
        self.local.put_typed(&typed_key, Arc::clone(&value));
        if self.local.generation() != generation {
            // An invalidation raced the load; serve the value but do not keep it.
            self.local.invalidate_key(key);
        } else {
            self.track_store_ttl(key).await;
        }
        metrics::record_cache_hit("store");
        metrics::set_cache_entries(self.local.len());
        Ok(Some(value))
    }

    /// Set a value without expiry. Any pending local expiry of `key` is cancelled.
    pub async fn set<T: CacheValue>(&self, key: &str, value: T) -> Result<(), CacheError> {
        self.ensure_open()?;
        let payload = self.codec.encode(&value)?;
        self.store.set(key, &payload).await?;

        self.coordinator.cancel_expiration_task(key);
        self.remember(key, payload, value);
        self.coordinator.publish_invalidation(key).await;
        Ok(())
    }

    /// Set a value that expires after `seconds`.
    ///
    /// The backing store enforces the TTL; locally a check is scheduled for
    /// the same deadline that evicts the key if the store no longer has it.
    pub async fn set_with_ttl<T: CacheValue>(
        &self,
        key: &str,
        value: T,
        seconds: u64,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        let payload = self.codec.encode(&value)?;
        self.store.set_with_expiry(key, &payload, seconds).await?;

        self.remember(key, payload, value);
        self.schedule_expiry_check(key, seconds);
        self.coordinator.publish_invalidation(key).await;
        Ok(())
    }

    /// Delete keys from the backing store and every node's local cache.
    /// Returns how many keys the store had.
    pub async fn delete(&self, keys: &[&str]) -> Result<u64, CacheError> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(keys).await?;
        for key in keys {
            self.coordinator.invalidate_key(key);
            self.coordinator.publish_invalidation(key).await;
        }
        debug!(keys = keys.len(), removed, "Deleted keys");
        Ok(removed)
    }

    /// Clear the backing store and every node's local cache.
    pub async fn delete_all(&self) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.store.flush_all().await?;
        self.coordinator.clear_local(InvalidationSource::Local);
        self.coordinator.publish_clear().await;
        info!("Cleared backing store and local caches");
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.store.exists(key).await?)
    }

    /// Set a timeout on `key`. Returns `false` if the key does not exist.
    pub async fn expire(&self, key: &str, seconds: u64) -> Result<bool, CacheError> {
        self.ensure_open()?;
        let applied = self.store.expire(key, seconds).await?;
        if applied {
            self.schedule_expiry_check(key, seconds);
        }
        Ok(applied)
    }

    /// Remaining time to live in seconds; `-2` if missing, `-1` if persistent.
    pub async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.ensure_open()?;
        Ok(self.store.ttl(key).await?)
    }

    /// Drop this node's local cache and pending expiries. Nothing is broadcast.
    pub fn clear_local(&self) {
        self.coordinator.clear_local(InvalidationSource::Local);
    }

    /// Publish an application message. Transport failures are logged only.
    pub async fn publish<M: Serialize + ?Sized>(
        &self,
        channel: &str,
        message: &M,
    ) -> Result<(), CacheError> {
        self.ensure_open()?;
        let payload = self.codec.encode(message)?;
        if let Err(e) = self.store.publish(channel, &payload).await {
            warn!(channel = %channel, error = %e, "Failed to publish message");
        } else {
            metrics::record_published(PublishKind::App);
        }
        Ok(())
    }

    /// Subscribe `handler` to application messages on `channel`.
    ///
    /// Shares the node's subscription connection with the coherence channels.
    /// Messages that do not decode as `M` are logged and dropped.
    pub async fn subscribe<M, F>(&self, channel: &str, handler: F) -> Result<SubscriberId, CacheError>
    where
        M: CacheValue,
        F: Fn(M) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let codec = self.codec;
        let handler: MessageHandler = Arc::new(move |channel: &str, payload: &[u8]| {
            match codec.decode::<M>(payload) {
                Ok(message) => handler(message),
                Err(e) => warn!(channel = %channel, error = %e, "Dropping undecodable message"),
            }
        });
        Ok(self.listener.subscribe(channel, handler).await?)
    }

    pub fn unsubscribe(&self, channel: &str, id: SubscriberId) -> bool {
        self.listener.unsubscribe(channel, id)
    }

    /// Stop the listener, cancel expiries and drop the local cache. Idempotent;
    /// every later operation fails with [`CacheError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.coordinator.shutdown();
        self.listener.shutdown().await;
        self.local.clear();
        info!("Coherent cache shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local(&self) -> &Arc<LocalCacheStore> {
        &self.local
    }

    pub fn coordinator(&self) -> &Arc<InvalidationCoordinator> {
        &self.coordinator
    }

    pub fn listener_state(&self) -> ListenerState {
        self.listener.state()
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub(super) fn ensure_open(&self) -> Result<(), CacheError> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn remember<T: CacheValue>(&self, key: &str, payload: Vec<u8>, value: T) {
        let descriptor = TypeDescriptor::of::<T>();
        self.local
            .put_raw_with_origin(key, payload, Some(descriptor));
        self.local
            .put_typed(&CompositeKey::new(key).typed(&descriptor), Arc::new(value));
        metrics::set_cache_entries(self.local.len());
    }

    /// Schedules a local expiry check if the store reports a TTL for `key`.
    ///
    /// The store rounds to whole seconds, so `0` still means "expiring"; the
    /// check then runs one second later rather than never.
    async fn track_store_ttl(&self, key: &str) {
        match self.store.ttl(key).await {
            Ok(seconds) if seconds >= 0 => self.schedule_expiry_check(key, seconds.max(1) as u64),
            Ok(_) => {}
            Err(e) => debug!(key = %key, error = %e, "Could not read TTL"),
        }
    }

    fn schedule_expiry_check(&self, key: &str, seconds: u64) {
        schedule_expiry_check(&self.coordinator, Arc::clone(&self.store), key, seconds);
    }
}

/// On fire: if the store no longer has `key`, evict it locally and broadcast;
/// if it is still there with a TTL, check again when that runs out. A key
/// that became persistent keeps its local copy.
fn schedule_expiry_check(
    coordinator: &Arc<InvalidationCoordinator>,
    store: Arc<dyn BackingStore>,
    key: &str,
    seconds: u64,
) {
    let weak = Arc::downgrade(coordinator);
    coordinator.schedule_expiration(key, Duration::from_secs(seconds), move |key| async move {
        let Some(coordinator) = weak.upgrade() else {
            return;
        };
        match store.exists(&key).await {
            Ok(false) => {
                debug!(key = %key, "Key expired in backing store");
                coordinator.evict_expired(&key);
                coordinator.publish_invalidation(&key).await;
            }
            Ok(true) => match store.ttl(&key).await {
                Ok(-1) => debug!(key = %key, "Key made persistent, keeping local copy"),
                Ok(remaining) if remaining >= 0 => {
                    debug!(key = %key, remaining, "Key still expiring, checking again later");
                    schedule_expiry_check(&coordinator, store, &key, remaining.max(1) as u64);
                }
                Ok(_) => {
                    // Expired between the two reads.
                    coordinator.evict_expired(&key);
                    coordinator.publish_invalidation(&key).await;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Expiry check failed, evicting local copy");
                    coordinator.evict_expired(&key);
                }
            },
            Err(e) => {
                warn!(key = %key, error = %e, "Expiry check failed, evicting local copy");
                coordinator.evict_expired(&key);
            }
        }
    });
}

/// Builder for [`CoherentCache`].
#[derive(Default)]
pub struct CoherentCacheBuilder {
    store: Option<Arc<dyn BackingStore>>,
    transport: Option<Arc<dyn PubSubTransport>>,
    config: CacheConfig,
}

impl CoherentCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backing store.
    pub fn with_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the transport for the subscription connection.
    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use an in-process store as both backing store and transport.
    pub fn with_memory_store(self, store: &MemoryStore) -> Self {
        self.with_store(Arc::new(store.clone()))
            .with_transport(Arc::new(store.clone()))
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    /// Build the cache and subscribe the coherence channels.
    ///
    /// Does not fail when the subscription cannot be established; the
    /// listener keeps retrying in the background.
    pub async fn build(self) -> Result<CoherentCache, CacheError> {
        let store = self
            .store
            .ok_or_else(|| CacheError::Config("backing store is required".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| CacheError::Config("pub/sub transport is required".to_string()))?;
        self.config.validate().map_err(CacheError::Config)?;

        let bus = InvalidationBus::new(Arc::clone(&store), transport);
        let listener = Arc::new(SubscriptionListener::new(
            bus.clone(),
            self.config.listener.clone(),
        ));
        let local = Arc::new(LocalCacheStore::new());
        let coordinator = InvalidationCoordinator::new(
            Arc::clone(&local),
            Arc::clone(&listener),
            bus,
            ChannelNames::from(&self.config.channels),
        );
        coordinator.initialize().await?;

        Ok(CoherentCache {
            store,
            local,
            coordinator,
            listener,
            codec: self.config.codec,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}
