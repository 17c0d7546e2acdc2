//! Error types for the coherent cache.
//!
//! Transport failures against the backing store surface as [`StoreError`],
//! payload problems as [`CodecError`]. [`CacheError`] is what callers of the
//! facade see.

/// Errors raised by a [`BackingStore`](crate::backend::BackingStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No connection could be obtained or the connection dropped.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection failure.
        message: String,
    },

    /// The store rejected or failed to execute a command.
    #[error("Command error: {message}")]
    Command {
        /// Description of the command failure.
        message: String,
    },

    /// The key holds a value of a different data type.
    #[error("Wrong type for key {key}: expected {expected}")]
    WrongType {
        /// The offending key.
        key: String,
        /// The data type the command operates on.
        expected: &'static str,
    },
}

impl StoreError {
    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a new `Command` error.
    #[must_use]
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Creates a new `WrongType` error.
    #[must_use]
    pub fn wrong_type(key: impl Into<String>, expected: &'static str) -> Self {
        Self::WrongType {
            key: key.into(),
            expected,
        }
    }

    /// Returns `true` if this is a transport-level failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::connection(err.to_string())
        } else {
            Self::command(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::connection(err.to_string())
    }
}

/// Errors raised while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// Errors returned by [`CoherentCache`](crate::CoherentCache) operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The write-through or a pass-through query against the backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A value could not be encoded, or a destructive read could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The key was cached under a different type than the one requested.
    #[error("Type mismatch for key {key}: requested {expected}, cached as {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The subscription listener refused the request.
    #[error(transparent)]
    Listener(#[from] crate::pubsub::ListenerError),

    /// The cache was built with missing or invalid parts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cache has been shut down.
    #[error("Cache is closed")]
    Closed,
}

impl CacheError {
    pub(crate) fn type_mismatch(
        key: impl Into<String>,
        expected: &'static str,
        found: &'static str,
    ) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected,
            found,
        }
    }
}
