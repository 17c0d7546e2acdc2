//! Coherent two-tier cache.
//!
//! - [`LocalCacheStore`]: in-process tier of raw payloads and typed views
//! - [`InvalidationCoordinator`]: turns local writes into broadcasts and
//!   broadcasts into local evictions
//! - [`CoherentCache`]: the public read-through, write-through facade

mod collections;
pub mod coordinator;
pub mod facade;
pub mod local;

pub use coordinator::InvalidationCoordinator;
pub use facade::{CoherentCache, CoherentCacheBuilder};
pub use local::{CompositeKey, LocalCacheStore, RawEntry, TypedSlot};
