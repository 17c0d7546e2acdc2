//! Publish/subscribe plumbing for cross-node cache coherence.
//!
//! [`InvalidationBus`] publishes through the request pool of the backing
//! store; [`SubscriptionListener`] owns the node's one long-lived subscription
//! connection.
//!
//! ## Message flow
//!
//! ```text
//! Node A: cache.set("user:1", ..)
//!   ↓
//! PUBLISH cache:invalidate "user:1"
//!   ↓
//! Node B: listener receives "user:1" → coordinator evicts local views
//! Node C: listener receives "user:1" → coordinator evicts local views
//! ```

mod listener;

use std::sync::Arc;

use crate::backend::{BackingStore, PubSubTransport, SubscriptionConnection};
use crate::config::ChannelsConfig;
use crate::metrics::PublishKind;

pub use listener::{
    ListenerError, ListenerState, MessageHandler, SubscriberId, SubscriptionListener,
};

/// Errors from the pub/sub transport.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Pub/sub connection error: {0}")]
    Connect(String),

    #[error("Subscribe to {channel} failed: {message}")]
    Subscribe { channel: String, message: String },

    #[error("Unsubscribe from {channel} failed: {message}")]
    Unsubscribe { channel: String, message: String },

    #[error("Publish error: {0}")]
    Publish(String),
}

impl BusError {
    pub fn subscribe(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn unsubscribe(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unsubscribe {
            channel: channel.into(),
            message: message.into(),
        }
    }
}

/// Names of the two fixed coherence channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub invalidate: String,
    pub clear: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::from(&ChannelsConfig::default())
    }
}

impl From<&ChannelsConfig> for ChannelNames {
    fn from(config: &ChannelsConfig) -> Self {
        Self {
            invalidate: config.invalidate.clone(),
            clear: config.clear.clone(),
        }
    }
}

/// Control message carried on the coherence channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMessage {
    /// Every node drops its local views of this key.
    KeyInvalidated(String),
    /// Every node drops its whole local cache.
    AllCleared,
}

impl InvalidationMessage {
    /// Channel the message travels on.
    pub fn channel<'a>(&self, names: &'a ChannelNames) -> &'a str {
        match self {
            Self::KeyInvalidated(_) => &names.invalidate,
            Self::AllCleared => &names.clear,
        }
    }

    /// Wire payload: the literal key, or nothing for a clear.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::KeyInvalidated(key) => key.as_bytes(),
            Self::AllCleared => &[],
        }
    }

    /// Interprets a received message. Returns `None` for foreign channels and
    /// for key payloads that are not UTF-8.
    pub fn parse(names: &ChannelNames, channel: &str, payload: &[u8]) -> Option<Self> {
        if channel == names.invalidate {
            std::str::from_utf8(payload)
                .ok()
                .map(|key| Self::KeyInvalidated(key.to_string()))
        } else if channel == names.clear {
            // The payload of a clear is ignored.
            Some(Self::AllCleared)
        } else {
            None
        }
    }
}

/// Pass-through to the backing store's publish/subscribe facility.
#[derive(Clone)]
pub struct InvalidationBus {
    store: Arc<dyn BackingStore>,
    transport: Arc<dyn PubSubTransport>,
}

impl InvalidationBus {
    pub fn new(store: Arc<dyn BackingStore>, transport: Arc<dyn PubSubTransport>) -> Self {
        Self { store, transport }
    }

    /// Fire-and-forget publish through the request pool.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        self.store
            .publish(channel, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    pub async fn publish_message(
        &self,
        names: &ChannelNames,
        message: &InvalidationMessage,
    ) -> Result<(), BusError> {
        self.publish(message.channel(names), message.payload()).await?;
        crate::metrics::record_published(match message {
            InvalidationMessage::KeyInvalidated(_) => PublishKind::Invalidate,
            InvalidationMessage::AllCleared => PublishKind::Clear,
        });
        Ok(())
    }

    /// Opens one physical subscription covering `channels`.
    pub async fn open_subscription(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn SubscriptionConnection>, BusError> {
        let mut connection = self.transport.connect().await?;
        for channel in channels {
            connection.subscribe(channel).await?;
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> ChannelNames {
        ChannelNames {
            invalidate: "inv".into(),
            clear: "clr".into(),
        }
    }

    #[test]
    fn key_payload_is_the_literal_key() {
        let msg = InvalidationMessage::KeyInvalidated("user:1".into());
        assert_eq!(msg.channel(&names()), "inv");
        assert_eq!(msg.payload(), b"user:1");
        assert_eq!(
            InvalidationMessage::parse(&names(), "inv", b"user:1"),
            Some(msg)
        );
    }

    #[test]
    fn clear_payload_is_ignored() {
        assert_eq!(
            InvalidationMessage::parse(&names(), "clr", b"anything"),
            Some(InvalidationMessage::AllCleared)
        );
        assert!(InvalidationMessage::AllCleared.payload().is_empty());
    }

    #[test]
    fn foreign_channels_are_not_control_messages() {
        assert_eq!(InvalidationMessage::parse(&names(), "app", b"x"), None);
        assert_eq!(InvalidationMessage::parse(&names(), "inv", &[0xff, 0xfe]), None);
    }
}
