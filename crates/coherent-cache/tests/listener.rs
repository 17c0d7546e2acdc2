use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coherent_cache::backend::{BusMessage, SubscriptionConnection};
use coherent_cache::config::ListenerConfig;
use coherent_cache::pubsub::{
    BusError, InvalidationBus, ListenerError, ListenerState, MessageHandler, SubscriptionListener,
};
use coherent_cache::{BackingStore, CoherentCache, MemoryStore, PubSubTransport};

fn listener_config() -> ListenerConfig {
    ListenerConfig {
        reconnect_delay_ms: 1_000,
        start_timeout_ms: 500,
        shutdown_timeout_ms: 500,
    }
}

fn listener(store: &MemoryStore) -> SubscriptionListener {
    let bus = InvalidationBus::new(Arc::new(store.clone()), Arc::new(store.clone()));
    SubscriptionListener::new(bus, listener_config())
}

fn counting(counter: &Arc<AtomicUsize>) -> MessageHandler {
    let counter = Arc::clone(counter);
    Arc::new(move |_: &str, _: &[u8]| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Transport whose connections accept subscriptions but never finish an unsubscribe.
struct HangingTransport {
    dropped: Arc<AtomicBool>,
}

struct HangingConnection {
    dropped: Arc<AtomicBool>,
}

impl Drop for HangingConnection {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PubSubTransport for HangingTransport {
    async fn connect(&self) -> Result<Box<dyn SubscriptionConnection>, BusError> {
        Ok(Box::new(HangingConnection {
            dropped: Arc::clone(&self.dropped),
        }))
    }
}

#[async_trait]
impl SubscriptionConnection for HangingConnection {
    async fn subscribe(&mut self, _channel: &str) -> Result<(), BusError> {
        Ok(())
    }

    async fn unsubscribe(&mut self, _channel: &str) -> Result<(), BusError> {
        std::future::pending::<Result<(), BusError>>().await
    }

    async fn next_message(&mut self) -> Option<BusMessage> {
        std::future::pending::<Option<BusMessage>>().await
    }
}

#[tokio::test(start_paused = true)]
async fn adding_channels_reuses_the_live_connection() {
    let store = MemoryStore::new();
    let listener = listener(&store);
    let hits = Arc::new(AtomicUsize::new(0));

    listener.subscribe("a", counting(&hits)).await.unwrap();
    listener.subscribe("b", counting(&hits)).await.unwrap();
    listener.subscribe("b", counting(&hits)).await.unwrap();
    settle().await;
    assert_eq!(store.subscription_connects(), 1);
    assert_eq!(listener.channels(), vec!["a".to_string(), "b".to_string()]);

    store.publish("b", b"x").await.unwrap();
    store.publish("c", b"x").await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removing_the_last_channel_goes_idle() {
    let store = MemoryStore::new();
    let listener = listener(&store);
    let hits = Arc::new(AtomicUsize::new(0));

    let first = listener.subscribe("a", counting(&hits)).await.unwrap();
    let second = listener.subscribe("b", counting(&hits)).await.unwrap();
    assert_eq!(listener.state(), ListenerState::Active);

    assert!(listener.unsubscribe("a", first));
    settle().await;
    assert_eq!(listener.state(), ListenerState::Active);
    store.publish("a", b"x").await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert!(listener.unsubscribe("b", second));
    assert!(!listener.unsubscribe("b", second));
    settle().await;
    assert_eq!(listener.state(), ListenerState::Idle);
    assert!(listener.channels().is_empty());

    // A new channel starts a fresh connection.
    listener.subscribe("c", counting(&hits)).await.unwrap();
    assert_eq!(listener.state(), ListenerState::Active);
    assert_eq!(store.subscription_connects(), 2);

    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lost_connection_resubscribes_every_channel() {
    let store = MemoryStore::new();
    let listener = listener(&store);
    let hits = Arc::new(AtomicUsize::new(0));
    listener.subscribe("a", counting(&hits)).await.unwrap();
    listener.subscribe("b", counting(&hits)).await.unwrap();

    store.sever_subscriptions();
    settle().await;
    assert_eq!(listener.state(), ListenerState::Reconnecting);

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(listener.state(), ListenerState::Active);
    assert_eq!(store.subscription_connects(), 2);

    store.publish("a", b"x").await.unwrap();
    store.publish("b", b"x").await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_returns_while_the_transport_is_down() {
    let store = MemoryStore::new();
    store.set_pubsub_available(false);
    let listener = listener(&store);
    let hits = Arc::new(AtomicUsize::new(0));

    listener.subscribe("a", counting(&hits)).await.unwrap();
    assert_ne!(listener.state(), ListenerState::Active);
    assert_eq!(store.subscription_connects(), 0);

    store.set_pubsub_available(true);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(listener.state(), ListenerState::Active);

    store.publish("a", b"x").await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    listener.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_terminal_and_idempotent() {
    let store = MemoryStore::new();
    let listener = listener(&store);
    let hits = Arc::new(AtomicUsize::new(0));
    let mut states = listener.watch_state();

    listener.subscribe("a", counting(&hits)).await.unwrap();
    listener.shutdown().await;
    listener.shutdown().await;

    assert_eq!(listener.state(), ListenerState::Stopped);
    assert_eq!(*states.borrow_and_update(), ListenerState::Stopped);
    assert!(listener.channels().is_empty());
    assert!(matches!(
        listener.subscribe("a", counting(&hits)).await,
        Err(ListenerError::Stopped)
    ));

    store.publish("a", b"x").await.unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_a_worker_stuck_unsubscribing() {
    let dropped = Arc::new(AtomicBool::new(false));
    let transport = HangingTransport {
        dropped: Arc::clone(&dropped),
    };
    let bus = InvalidationBus::new(Arc::new(MemoryStore::new()), Arc::new(transport));
    let listener = SubscriptionListener::new(bus, listener_config());
    let hits = Arc::new(AtomicUsize::new(0));
    listener.subscribe("a", counting(&hits)).await.unwrap();
    assert_eq!(listener.state(), ListenerState::Active);

    let started = tokio::time::Instant::now();
    listener.shutdown().await;
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_secs(1));
    assert_eq!(listener.state(), ListenerState::Stopped);

    // The aborted task drops its connection.
    settle().await;
    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn node_started_without_pubsub_catches_up() {
    let store = MemoryStore::new();
    store.set_pubsub_available(false);

    let mut config = coherent_cache::CacheConfig::default();
    config.listener = listener_config();
    let degraded = CoherentCache::builder()
        .with_memory_store(&store)
        .with_config(config)
        .build()
        .await
        .unwrap();
    let writer = CoherentCache::builder()
        .with_store(Arc::new(store.clone()))
        .with_transport(Arc::new(MemoryStore::new()))
        .build()
        .await
        .unwrap();

    writer.set("k", 1u32).await.unwrap();
    assert_eq!(*degraded.get::<u32>("k").await.unwrap().unwrap(), 1);

    store.set_pubsub_available(true);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(degraded.listener_state(), ListenerState::Active);

    writer.set("k", 2u32).await.unwrap();
    settle().await;
    assert_eq!(*degraded.get::<u32>("k").await.unwrap().unwrap(), 2);

    writer.shutdown().await;
    degraded.shutdown().await;
}
