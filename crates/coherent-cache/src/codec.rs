//! Payload encoding and the type descriptors used for typed cache slots.

use std::any::TypeId;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Values that can be written to and read from the cache.
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Explicit descriptor for the type a value was decoded into.
///
/// Typed slots in the local cache are keyed and checked by descriptor, so a
/// caller asking for a different type than the one cached gets an error
/// instead of a silent reinterpretation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    id: TypeId,
    name: &'static str,
}

impl TypeDescriptor {
    /// Descriptor for `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Fully qualified type name, used as the type tag in composite keys.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Wire format for values, hash fields, collection members and messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// JSON via `serde_json`.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// MessagePack via `rmp-serde`, with named struct fields.
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl Codec {
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string())),
            Codec::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
            Codec::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }

    /// Encodes every item of a slice.
    pub fn encode_all<T: Serialize>(&self, values: &[T]) -> Result<Vec<Vec<u8>>, CodecError> {
        values.iter().map(|v| self.encode(v)).collect()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Json => write!(f, "json"),
            Codec::MessagePack => write!(f, "msgpack"),
        }
    }
}
