//! Binds local writes to invalidation broadcasts and incoming broadcasts to
//! local eviction. Also owns the per-key expiry tasks.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::local::LocalCacheStore;
use crate::error::CacheError;
use crate::metrics::{self, InvalidationSource};
use crate::pubsub::{
    ChannelNames, InvalidationBus, InvalidationMessage, MessageHandler, SubscriberId,
    SubscriptionListener,
};

/// One pending local expiry.
struct ExpiryTask {
    id: u64,
    fire_at: Instant,
    handle: AbortHandle,
}

pub struct InvalidationCoordinator {
    local: Arc<LocalCacheStore>,
    listener: Arc<SubscriptionListener>,
    bus: InvalidationBus,
    channels: ChannelNames,
    expirations: DashMap<String, ExpiryTask>,
    next_task: AtomicU64,
    registrations: Mutex<Vec<(String, SubscriberId)>>,
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

impl InvalidationCoordinator {
    pub fn new(
        local: Arc<LocalCacheStore>,
        listener: Arc<SubscriptionListener>,
        bus: InvalidationBus,
        channels: ChannelNames,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            listener,
            bus,
            channels,
            expirations: DashMap::new(),
            next_task: AtomicU64::new(1),
            registrations: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    /// Subscribes the invalidate and clear channels. Calling it again is a no-op.
    ///
    /// Returns once both channels are registered; if the subscription
    /// connection is not up yet this is bounded by the listener's start timeout.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), CacheError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A weak reference keeps the listener from holding the coordinator alive.
        let weak = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |channel: &str, payload: &[u8]| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.handle_message(channel, payload);
            }
        });

        for channel in [&self.channels.invalidate, &self.channels.clear] {
            let id = self.listener.subscribe(channel, Arc::clone(&handler)).await?;
            self.registrations.lock().push((channel.clone(), id));
        }
        Ok(())
    }

    fn handle_message(&self, channel: &str, payload: &[u8]) {
        match InvalidationMessage::parse(&self.channels, channel, payload) {
            Some(InvalidationMessage::KeyInvalidated(key)) => {
                debug!(key = %key, "Received cache invalidation");
                self.evict(&key, InvalidationSource::Remote);
            }
            Some(InvalidationMessage::AllCleared) => {
                debug!("Received cache clear");
                self.clear_local(InvalidationSource::Remote);
            }
            None => warn!(channel = %channel, "Ignoring malformed invalidation message"),
        }
    }

    /// Evicts `key` and its derived views locally and cancels its expiry task.
    /// Idempotent.
    pub fn invalidate_key(&self, key: &str) {
        self.evict(key, InvalidationSource::Local);
    }

    /// Same as [`invalidate_key`](Self::invalidate_key), counted as an expiry.
    pub(crate) fn evict_expired(&self, key: &str) {
        self.evict(key, InvalidationSource::Expiry);
    }

    fn evict(&self, key: &str, source: InvalidationSource) {
        let removed = self.local.invalidate_key(key);
        self.cancel_expiration_task(key);
        if removed > 0 {
            metrics::record_invalidation(source);
            metrics::set_cache_entries(self.local.len());
        }
    }

    /// Drops the whole local cache and every pending expiry.
    pub(crate) fn clear_local(&self, source: InvalidationSource) {
        self.local.clear();
        self.cancel_all_expiration_tasks();
        metrics::record_clear(source);
        metrics::set_cache_entries(0);
    }

    /// Tells every node to drop `key`. Local state is left alone.
    pub async fn publish_invalidation(&self, key: &str) {
        let message = InvalidationMessage::KeyInvalidated(key.to_string());
        match self.bus.publish_message(&self.channels, &message).await {
            Ok(()) => debug!(key = %key, "Published cache invalidation"),
            Err(e) => warn!(key = %key, error = %e, "Failed to publish cache invalidation"),
        }
    }

    /// Tells every node to drop its whole local cache.
    pub async fn publish_clear(&self) {
        match self
            .bus
            .publish_message(&self.channels, &InvalidationMessage::AllCleared)
            .await
        {
            Ok(()) => debug!("Published cache clear"),
            Err(e) => warn!(error = %e, "Failed to publish cache clear"),
        }
    }

    /// Replaces any pending expiry of `key` with one firing after `after`.
    ///
    /// When it fires the task record is removed first, then `on_expire` runs
    /// with the key. A task that was cancelled or replaced never calls it.
    pub fn schedule_expiration<F, Fut>(self: &Arc<Self>, key: &str, after: Duration, on_expire: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let fire_at = Instant::now() + after;
        let weak = Arc::downgrade(self);
        let owned_key = key.to_string();

        let spawn = move || {
            tokio::spawn(async move {
                tokio::time::sleep_until(fire_at).await;
                let current = match weak.upgrade() {
                    Some(coordinator) => coordinator
                        .expirations
                        .remove_if(&owned_key, |_, task| task.id == id)
                        .is_some(),
                    None => false,
                };
                if current {
                    debug!(key = %owned_key, "Local expiry fired");
                    on_expire(owned_key).await;
                }
            })
            .abort_handle()
        };

        match self.expirations.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get().handle.abort();
                entry.insert(ExpiryTask {
                    id,
                    fire_at,
                    handle: spawn(),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(ExpiryTask {
                    id,
                    fire_at,
                    handle: spawn(),
                });
            }
        }
    }

    /// Cancels the pending expiry of `key`. Returns `false` if there was none.
    pub fn cancel_expiration_task(&self, key: &str) -> bool {
        match self.expirations.remove(key) {
            Some((_, task)) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_expiration_tasks(&self) {
        self.expirations.retain(|_, task| {
            task.handle.abort();
            false
        });
    }

    pub fn pending_expirations(&self) -> usize {
        self.expirations.len()
    }

    /// When the pending expiry of `key` fires, if any.
    pub fn expiration_deadline(&self, key: &str) -> Option<Instant> {
        self.expirations.get(key).map(|task| task.fire_at)
    }

    /// Unsubscribes both channels and cancels every pending expiry. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for (channel, id) in registrations {
            self.listener.unsubscribe(&channel, id);
        }
        self.cancel_all_expiration_tasks();
        debug!("Invalidation coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::config::ListenerConfig;
    use std::sync::atomic::AtomicUsize;

    fn coordinator(store: &MemoryStore) -> Arc<InvalidationCoordinator> {
        let bus = InvalidationBus::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let listener = Arc::new(SubscriptionListener::new(
            bus.clone(),
            ListenerConfig::default(),
        ));
        InvalidationCoordinator::new(
            Arc::new(LocalCacheStore::new()),
            listener,
            bus,
            ChannelNames::default(),
        )
    }

    fn counter_callback(
        fired: Arc<AtomicUsize>,
    ) -> impl FnOnce(String) -> std::future::Ready<()> + Send + 'static {
        move |_: String| {
            fired.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_task() {
        let coordinator = coordinator(&MemoryStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        coordinator.schedule_expiration("k", Duration::from_secs(2), counter_callback(Arc::clone(&fired)));
        coordinator.schedule_expiration("k", Duration::from_secs(10), counter_callback(Arc::clone(&fired)));
        assert_eq!(coordinator.pending_expirations(), 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending_expirations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_tasks_never_fire() {
        let coordinator = coordinator(&MemoryStore::new());
        let fired = Arc::new(AtomicUsize::new(0));

        coordinator.schedule_expiration("a", Duration::from_secs(1), counter_callback(Arc::clone(&fired)));
        coordinator.schedule_expiration("b", Duration::from_secs(1), counter_callback(Arc::clone(&fired)));
        assert!(coordinator.cancel_expiration_task("a"));
        assert!(!coordinator.cancel_expiration_task("a"));
        coordinator.cancel_all_expiration_tasks();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidating_a_key_cancels_its_expiry() {
        let coordinator = coordinator(&MemoryStore::new());
        let fired = Arc::new(AtomicUsize::new(0));
        coordinator.local.put_raw("k", b"1".to_vec());

        coordinator.schedule_expiration("k", Duration::from_secs(1), counter_callback(Arc::clone(&fired)));
        assert!(coordinator.expiration_deadline("k").is_some());
        coordinator.invalidate_key("k");
        coordinator.invalidate_key("k");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(coordinator.local.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_both_channels() {
        let store = MemoryStore::new();
        let coordinator = coordinator(&store);
        coordinator.initialize().await.unwrap();
        assert_eq!(
            coordinator.listener.channels(),
            vec!["cache:clear".to_string(), "cache:invalidate".to_string()]
        );

        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.listener.channels().is_empty());
        coordinator.listener.shutdown().await;
    }
}
