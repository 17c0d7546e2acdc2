//! Process-local cache tier.
//!
//! Two maps, both lock-free for callers:
//! - raw slots, keyed by the plain key, holding the encoded payload;
//! - typed slots, keyed by a [`CompositeKey`], holding decoded values.
//!
//! Every typed slot key starts with its base key plus [`CompositeKey::DELIMITER`],
//! which is what makes exact-key and prefix invalidation possible.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::codec::TypeDescriptor;

pub(crate) const HASH: &str = "hash";
pub(crate) const SET: &str = "set";
pub(crate) const ZSET: &str = "zset";
pub(crate) const LIST: &str = "list";

/// Collection kinds; their views live under `<key>:<kind>:`.
const COLLECTION_KINDS: [&str; 4] = [HASH, SET, ZSET, LIST];

/// Encoded payload as read from or written to the backing store.
#[derive(Clone, Debug)]
pub struct RawEntry {
    pub payload: Arc<[u8]>,
    /// Type the payload was last decoded into or encoded from on this node.
    pub origin: Option<TypeDescriptor>,
}

/// A decoded value, type-erased, with the descriptor it was stored under.
#[derive(Clone)]
pub struct TypedSlot {
    descriptor: TypeDescriptor,
    value: Arc<dyn Any + Send + Sync>,
}

impl TypedSlot {
    pub fn new<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            descriptor: TypeDescriptor::of::<T>(),
            value,
        }
    }

    pub fn descriptor(&self) -> TypeDescriptor {
        self.descriptor
    }

    /// Returns the value as `T`, or the descriptor it was actually stored under.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, TypeDescriptor> {
        let descriptor = self.descriptor;
        self.value.downcast::<T>().map_err(|_| descriptor)
    }
}

impl fmt::Debug for TypedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedSlot")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Key of a cached view: a base key plus view parameters.
///
/// ```text
/// user:1:my_app::User               typed value of "user:1"
/// scores:zset:range:0:9:f64         zrange view of "scores"
/// queue:list:index:-1:alloc::string::String
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub const DELIMITER: char = ':';

    pub fn new(base: &str) -> Self {
        Self(base.to_string())
    }

    /// Appends one view parameter.
    pub fn push(mut self, part: impl fmt::Display) -> Self {
        use std::fmt::Write;
        self.0.push(Self::DELIMITER);
        let _ = write!(self.0, "{part}");
        self
    }

    /// Appends the type tag; always the last part of a composite key.
    pub fn typed(self, descriptor: &TypeDescriptor) -> Self {
        self.push(descriptor.name())
    }

    /// Prefix shared by every view derived from `base`.
    pub fn key_prefix(base: &str) -> String {
        format!("{base}{}", Self::DELIMITER)
    }

    /// Prefix shared by every view of one collection kind, e.g. `"k:set:"`.
    pub fn view_prefix(base: &str, view: &str) -> String {
        format!("{base}{d}{view}{d}", d = Self::DELIMITER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CompositeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Thread-safe in-memory cache, read by any number of callers and written by
/// the coordinator and the facade.
#[derive(Default)]
pub struct LocalCacheStore {
    raw: DashMap<String, RawEntry>,
    typed: DashMap<String, TypedSlot>,
    generation: AtomicU64,
}

impl LocalCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the raw slot. Typed values decoded from the previous payload
    /// are dropped; collection views of the key are kept.
    pub fn put_raw(&self, key: &str, payload: impl Into<Arc<[u8]>>) {
        self.put_raw_with_origin(key, payload, None);
    }

    pub fn put_raw_with_origin(
        &self,
        key: &str,
        payload: impl Into<Arc<[u8]>>,
        origin: Option<TypeDescriptor>,
    ) {
        self.remove_value_slots(key);
        self.raw.insert(
            key.to_string(),
            RawEntry {
                payload: payload.into(),
                origin,
            },
        );
    }

    pub fn get_raw(&self, key: &str) -> Option<RawEntry> {
        self.raw.get(key).map(|entry| entry.clone())
    }

    pub fn put_typed<T: Any + Send + Sync>(&self, key: &CompositeKey, value: Arc<T>) {
        self.typed
            .insert(key.as_str().to_string(), TypedSlot::new(value));
    }

    pub fn get_typed(&self, key: &CompositeKey) -> Option<TypedSlot> {
        self.typed.get(key.as_str()).map(|slot| slot.clone())
    }

    pub fn remove_typed(&self, key: &CompositeKey) -> bool {
        self.typed.remove(key.as_str()).is_some()
    }

    /// Counter bumped before every invalidation and clear.
    ///
    /// A reader that loaded a value from the backing store compares the
    /// generation seen before the load with the one after populating; if they
    /// differ an invalidation may have raced the load and the entry is dropped.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Removes the raw slot of `key` and every typed slot derived from it.
    /// Returns the number of slots removed.
    pub fn invalidate_key(&self, key: &str) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let raw = usize::from(self.raw.remove(key).is_some());
        raw + self.remove_typed_with_prefix(&CompositeKey::key_prefix(key))
    }

    /// Removes every typed slot whose key starts with `prefix`; raw slots are untouched.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.remove_typed_with_prefix(prefix)
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.raw.clear();
        self.typed.clear();
    }

    /// Number of raw and typed slots.
    pub fn len(&self) -> usize {
        self.raw.len() + self.typed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.typed.is_empty()
    }

    pub fn contains_raw(&self, key: &str) -> bool {
        self.raw.contains_key(key)
    }

    pub fn contains_typed(&self, key: &str) -> bool {
        self.typed.contains_key(key)
    }

    fn remove_typed_with_prefix(&self, prefix: &str) -> usize {
        let before = self.typed.len();
        self.typed.retain(|k, _| !k.starts_with(prefix));
        before.saturating_sub(self.typed.len())
    }

    fn remove_value_slots(&self, key: &str) -> usize {
        let prefix = CompositeKey::key_prefix(key);
        let before = self.typed.len();
        self.typed.retain(|k, _| match k.strip_prefix(prefix.as_str()) {
            Some(rest) => is_collection_view(rest),
            None => true,
        });
        before.saturating_sub(self.typed.len())
    }
}

/// `rest` is a composite key minus its base; `set:members:..` is a view while
/// a type path such as `set::Thing` is not.
fn is_collection_view(rest: &str) -> bool {
    COLLECTION_KINDS.iter().any(|kind| {
        rest.strip_prefix(*kind)
            .and_then(|tail| tail.strip_prefix(CompositeKey::DELIMITER))
            .is_some_and(|tail| !tail.starts_with(CompositeKey::DELIMITER))
    })
}
