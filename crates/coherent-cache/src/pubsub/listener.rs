//! The node's single subscription worker.
//!
//! One background task owns the physical subscription connection. Channel
//! changes are sent to it as commands and applied on the live connection, so
//! adding or removing a channel never costs a reconnect. When the connection
//! is lost the worker waits a fixed delay and resubscribes to the full,
//! current channel set.
//!
//! ```text
//! Idle ──subscribe──▶ Starting ──connected──▶ Active ──lost──▶ Reconnecting
//!  ▲                     ▲                      │                  │
//!  └───channel set empty─┼──────────────────────┘                  │
//!                        └──────────────delay──────────────────────┘
//!
//! any ──shutdown──▶ Stopped
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::InvalidationBus;
use crate::backend::{BusMessage, SubscriptionConnection};
use crate::config::ListenerConfig;

/// Callback invoked with `(channel, payload)` for every received message.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Handle returned by [`SubscriptionListener::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Lifecycle phase of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// No channels, not connected.
    Idle,
    /// Connection being established.
    Starting,
    /// Connected with at least one channel.
    Active,
    /// Connection lost, waiting to retry.
    Reconnecting,
    /// Shut down; terminal.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Subscription listener is stopped")]
    Stopped,
}

enum Command {
    /// `applied` fires once the live connection accepted the channel.
    Subscribe {
        channel: String,
        applied: oneshot::Sender<()>,
    },
    Unsubscribe(String),
}

/// Channel set and the command queue of the running worker.
struct SubscriptionState {
    channels: HashMap<String, Vec<(SubscriberId, MessageHandler)>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

struct Shared {
    bus: InvalidationBus,
    config: ListenerConfig,
    state: Mutex<SubscriptionState>,
    phase: watch::Sender<ListenerState>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

enum PumpExit {
    Cancelled,
    Idle,
    Lost,
}

/// Keeps one subscription connection alive over a mutable set of channels.
pub struct SubscriptionListener {
    shared: Arc<Shared>,
}

impl SubscriptionListener {
    pub fn new(bus: InvalidationBus, config: ListenerConfig) -> Self {
        let (phase, _) = watch::channel(ListenerState::Idle);
        Self {
            shared: Arc::new(Shared {
                bus,
                config,
                state: Mutex::new(SubscriptionState {
                    channels: HashMap::new(),
                    commands: None,
                }),
                phase,
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ListenerState {
        *self.shared.phase.borrow()
    }

    /// Receiver that observes phase changes.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.shared.phase.subscribe()
    }

    /// Channels with at least one registered handler, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<_> = self.shared.state.lock().channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Registers `handler` on `channel`.
    ///
    /// The first handler of a channel subscribes it on the live connection,
    /// starting the worker if none is running, and this returns once the
    /// connection has the channel. If that takes longer than the configured
    /// start timeout it returns anyway; the channel is picked up by the next
    /// (re)subscribe cycle.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriberId, ListenerError> {
        let id = SubscriberId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut applied = None;
        {
            let mut state = self.shared.state.lock();
            if self.shared.cancel.is_cancelled() {
                return Err(ListenerError::Stopped);
            }

            let handlers = state.channels.entry(channel.to_string()).or_default();
            let is_new = handlers.is_empty();
            handlers.push((id, handler));

            let worker_alive = state.commands.as_ref().is_some_and(|tx| !tx.is_closed());
            if !worker_alive {
                self.shared.spawn_worker(&mut state);
            } else if is_new {
                if let Some(tx) = &state.commands {
                    let (ack, ack_rx) = oneshot::channel();
                    let command = Command::Subscribe {
                        channel: channel.to_string(),
                        applied: ack,
                    };
                    if tx.send(command).is_ok() {
                        applied = Some(ack_rx);
                    }
                }
            }
        }

        match applied {
            Some(applied) => self.await_applied(channel, applied).await,
            None => self.await_active(channel).await,
        }
        Ok(id)
    }

    /// Removes a handler. Returns `false` if it was not registered.
    ///
    /// When the last handler of a channel goes, the channel is unsubscribed on
    /// the live connection; when the last channel goes, the connection is
    /// released and the listener returns to [`ListenerState::Idle`].
    pub fn unsubscribe(&self, channel: &str, id: SubscriberId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(handlers) = state.channels.get_mut(channel) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;

        if handlers.is_empty() {
            state.channels.remove(channel);
            if let Some(tx) = &state.commands {
                let _ = tx.send(Command::Unsubscribe(channel.to_string()));
            }
        }
        removed
    }

    /// Stops the worker. Idempotent.
    ///
    /// The worker unsubscribes its channels and drops the connection; if it
    /// has not exited within the shutdown timeout it is aborted.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            self.shared.cancel.cancel();
            state.commands = None;
        }

        let handle = self.shared.worker.lock().take();
        if let Some(mut handle) = handle {
            let timeout = self.shared.config.shutdown_timeout();
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Subscription worker exited"),
                Ok(Err(e)) => warn!(error = %e, "Subscription worker ended abnormally"),
                Err(_) => {
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "Subscription worker did not stop in time, aborting"
                    );
                    handle.abort();
                }
            }
        }

        self.shared.state.lock().channels.clear();
        self.shared.set_phase(ListenerState::Stopped);
    }

    async fn await_active(&self, channel: &str) {
        let mut phase = self.shared.phase.subscribe();
        let timeout = self.shared.config.start_timeout();
        let settled = tokio::time::timeout(
            timeout,
            phase.wait_for(|s| {
                matches!(
                    s,
                    ListenerState::Active | ListenerState::Idle | ListenerState::Stopped
                )
            }),
        )
        .await
        .is_ok();

        if !settled {
            warn!(
                channel = %channel,
                timeout_ms = timeout.as_millis() as u64,
                "Subscription not active yet, continuing without it"
            );
        }
    }

    async fn await_applied(&self, channel: &str, applied: oneshot::Receiver<()>) {
        let timeout = self.shared.config.start_timeout();
        match tokio::time::timeout(timeout, applied).await {
            Ok(Ok(())) => {}
            // Dropped unapplied: the connection is gone and the next cycle subscribes it.
            Ok(Err(_)) => debug!(channel = %channel, "Subscription deferred to reconnect"),
            Err(_) => warn!(
                channel = %channel,
                timeout_ms = timeout.as_millis() as u64,
                "Subscription not active yet, continuing without it"
            ),
        }
    }
}

impl Drop for SubscriptionListener {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    /// Moves to `next` unless already stopped.
    fn set_phase(&self, next: ListenerState) {
        self.phase.send_if_modified(|current| {
            if *current == ListenerState::Stopped || *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Subscription listener state change");
            *current = next;
            true
        });
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut SubscriptionState) {
        let (tx, rx) = mpsc::unbounded_channel();
        state.commands = Some(tx);
        self.set_phase(ListenerState::Starting);
        let handle = tokio::spawn(run_worker(Arc::clone(self), rx));
        *self.worker.lock() = Some(handle);
    }

    /// Hands the worker off to `Idle` if no channel is left.
    fn release_if_empty(&self) -> bool {
        let mut state = self.state.lock();
        if !state.channels.is_empty() {
            return false;
        }
        state.commands = None;
        self.set_phase(ListenerState::Idle);
        true
    }

    fn dispatch(&self, message: &BusMessage) {
        let handlers: Vec<MessageHandler> = match self.state.lock().channels.get(&message.channel)
        {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in handlers {
            let call = AssertUnwindSafe(|| handler(&message.channel, &message.payload));
            if std::panic::catch_unwind(call).is_err() {
                warn!(channel = %message.channel, "Message handler panicked");
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        if shared.cancel.is_cancelled() || shared.release_if_empty() {
            break;
        }
        let channels: Vec<String> = shared.state.lock().channels.keys().cloned().collect();

        shared.set_phase(ListenerState::Starting);
        let opened = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            opened = shared.bus.open_subscription(&channels) => opened,
        };

        match opened {
            Ok(mut connection) => {
                info!(channels = ?channels, "Subscription listener active");
                shared.set_phase(ListenerState::Active);
                match pump(&shared, connection.as_mut(), &mut commands).await {
                    PumpExit::Cancelled => {
                        release(&shared, connection.as_mut()).await;
                        break;
                    }
                    PumpExit::Idle => {
                        debug!("No channels left, releasing subscription connection");
                        return;
                    }
                    PumpExit::Lost => {
                        warn!("Subscription connection lost");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to open subscription");
            }
        }

        shared.set_phase(ListenerState::Reconnecting);
        crate::metrics::record_listener_reconnect();
        let delay = shared.config.reconnect_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Resubscribing after delay");
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if shared.cancel.is_cancelled() {
        shared.set_phase(ListenerState::Stopped);
    }
}

async fn pump(
    shared: &Shared,
    connection: &mut dyn SubscriptionConnection,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> PumpExit {
    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => return PumpExit::Cancelled,

            Some(command) = commands.recv() => {
                let result = match command {
                    Command::Subscribe { channel, applied } => {
                        let result = connection.subscribe(&channel).await;
                        if result.is_ok() {
                            let _ = applied.send(());
                        }
                        result
                    }
                    Command::Unsubscribe(channel) => connection.unsubscribe(&channel).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to change subscription");
                    return PumpExit::Lost;
                }
                if shared.release_if_empty() {
                    return PumpExit::Idle;
                }
            }

            message = connection.next_message() => match message {
                Some(message) => shared.dispatch(&message),
                None => return PumpExit::Lost,
            },
        }
    }
}

/// Unsubscribes every channel on a live connection before it is dropped.
async fn release(shared: &Shared, connection: &mut dyn SubscriptionConnection) {
    let channels: Vec<String> = shared.state.lock().channels.keys().cloned().collect();
    for channel in channels {
        if let Err(e) = connection.unsubscribe(&channel).await {
            debug!(channel = %channel, error = %e, "Unsubscribe during shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn listener(store: &MemoryStore) -> SubscriptionListener {
        let bus = InvalidationBus::new(Arc::new(store.clone()), Arc::new(store.clone()));
        SubscriptionListener::new(bus, ListenerConfig::default())
    }

    fn counting(counter: &Arc<AtomicUsize>) -> MessageHandler {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &str, _: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn panicking(_: &str, _: &[u8]) {
        panic!("handler bug");
    }

    #[tokio::test(start_paused = true)]
    async fn first_subscribe_starts_the_worker() {
        let store = MemoryStore::new();
        let listener = listener(&store);
        assert_eq!(listener.state(), ListenerState::Idle);

        let hits = Arc::new(AtomicUsize::new(0));
        listener.subscribe("a", counting(&hits)).await.unwrap();
        assert_eq!(listener.state(), ListenerState::Active);

        use crate::backend::BackingStore;
        store.publish("a", b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        listener.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn a_panicking_handler_does_not_stop_delivery() {
        use crate::backend::BackingStore;

        let store = MemoryStore::new();
        let listener = listener(&store);
        let hits = Arc::new(AtomicUsize::new(0));
        listener
            .subscribe("a", Arc::new(panicking))
            .await
            .unwrap();
        listener.subscribe("a", counting(&hits)).await.unwrap();

        store.publish("a", b"1").await.unwrap();
        store.publish("a", b"2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(listener.state(), ListenerState::Active);

        listener.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn added_channel_is_live_when_subscribe_returns() {
        use crate::backend::BackingStore;

        let store = MemoryStore::new();
        let listener = listener(&store);
        let hits = Arc::new(AtomicUsize::new(0));
        listener.subscribe("a", counting(&hits)).await.unwrap();
        listener.subscribe("b", counting(&hits)).await.unwrap();

        // Published before the worker gets another turn.
        store.publish("b", b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_handler_is_not_removed() {
        let store = MemoryStore::new();
        let listener = listener(&store);
        assert!(!listener.unsubscribe("nope", SubscriberId(42)));
    }
}
