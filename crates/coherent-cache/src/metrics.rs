//! Cache metrics.
//!
//! Recorded through the `metrics` facade; the host application decides
//! whether and how to export them.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "coherent_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "coherent_cache_misses_total";
    pub const CACHE_ENTRIES: &str = "coherent_cache_entries";
    pub const INVALIDATIONS_TOTAL: &str = "coherent_cache_invalidations_total";
    pub const CLEARS_TOTAL: &str = "coherent_cache_clears_total";
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "coherent_cache_messages_published_total";
    pub const LISTENER_RECONNECTS_TOTAL: &str = "coherent_cache_listener_reconnects_total";
}

/// Where an invalidation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationSource {
    Local,
    Remote,
    Expiry,
}

impl InvalidationSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Expiry => "expiry",
        }
    }
}

/// What a published message was for. Application channel names are not used
/// as labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    Invalidate,
    Clear,
    App,
}

impl PublishKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Invalidate => "invalidate",
            Self::Clear => "clear",
            Self::App => "app",
        }
    }
}

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Set the number of local cache entries.
pub fn set_cache_entries(count: usize) {
    gauge!(names::CACHE_ENTRIES).set(count as f64);
}

pub fn record_invalidation(source: InvalidationSource) {
    counter!(names::INVALIDATIONS_TOTAL, "source" => source.as_str()).increment(1);
}

pub fn record_clear(source: InvalidationSource) {
    counter!(names::CLEARS_TOTAL, "source" => source.as_str()).increment(1);
}

pub fn record_published(kind: PublishKind) {
    counter!(names::MESSAGES_PUBLISHED_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_listener_reconnect() {
    counter!(names::LISTENER_RECONNECTS_TOTAL).increment(1);
}
