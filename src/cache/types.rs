//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cache key - the resolved identity of one (endpoint, arguments) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a single request issued through the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a consumer subscribed to a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request status shared by query and mutation entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

impl QueryStatus {
    /// Whether a request has completed, successfully or not
    pub fn is_settled(&self) -> bool {
        matches!(self, QueryStatus::Fulfilled | QueryStatus::Rejected)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Uninitialized => write!(f, "uninitialized"),
            QueryStatus::Pending => write!(f, "pending"),
            QueryStatus::Fulfilled => write!(f, "fulfilled"),
            QueryStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Counters describing what the cache did on behalf of its consumers
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests actually handed to the transport
    pub transport_calls: u64,

    /// `initiate` calls answered by an in-flight request
    pub deduplicated: u64,

    /// Completions dropped because their request was superseded or aborted
    pub dropped_results: u64,

    /// Requests aborted by a consumer
    pub aborted: u64,

    /// Entries removed by the eviction timer
    pub evictions: u64,

    /// Entries hit by a tag invalidation
    pub invalidations: u64,

    /// Forced refetches issued by invalidation, polling or lifecycle signals
    pub refetches: u64,
}

impl CacheStats {
    /// Share of `initiate` calls served without a transport round trip, as a percentage
    pub fn dedup_rate(&self) -> f64 {
        let total = self.transport_calls + self.deduplicated;
        if total == 0 {
            0.0
        } else {
            (self.deduplicated as f64 / total as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ transport_calls: {}, deduplicated: {}, dedup_rate: {:.2}%, dropped: {}, evictions: {}, invalidations: {} }}",
            self.transport_calls,
            self.deduplicated,
            self.dedup_rate(),
            self.dropped_results,
            self.evictions,
            self.invalidations
        )
    }
}
