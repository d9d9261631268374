//! Tag-based invalidation
//!
//! Invalidation is planned against a snapshot of the state and executed by
//! the caller:
//! - Subscribed entries among the affected keys are force-refetched
//! - Unsubscribed ones are only marked `invalidated`, so the next subscriber
//!   refetches them instead of trusting possibly stale data

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

use crate::cache::config::ApiConfig;
use crate::cache::state::{CacheEvent, CacheState};
use crate::cache::tags::Tag;
use crate::cache::types::CacheKey;

/// Why a set of tags was invalidated
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// A mutation succeeded
    Mutation { endpoint: String },

    /// Invalidated directly by the caller
    Manual,

    /// Affected entries are dropped instead of refetched
    Removal,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Mutation { endpoint } => write!(f, "mutation succeeded: {}", endpoint),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::Removal => write!(f, "tag-based removal"),
        }
    }
}

/// What an invalidation will do to the current state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub tags: Vec<Tag>,

    /// Every key providing one of the tags
    pub affected: BTreeSet<CacheKey>,

    /// Subscribed keys, to be refetched with force
    pub refetch: Vec<CacheKey>,

    /// Unsubscribed keys, to be marked possibly stale
    pub marked: Vec<CacheKey>,
}

impl InvalidationPlan {
    /// Split the keys providing `tags` by whether anyone is subscribed
    pub fn compute(state: &CacheState, tags: &[Tag]) -> Self {
        let affected = state.affected_keys(tags);
        let (refetch, marked): (Vec<CacheKey>, Vec<CacheKey>) = affected
            .iter()
            .cloned()
            .partition(|key| state.query(key).is_some_and(|entry| entry.has_subscribers()));

        Self {
            tags: tags.to_vec(),
            affected,
            refetch,
            marked,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.affected.is_empty()
    }

    /// Reducer event flagging the unsubscribed keys
    pub fn mark_event(&self) -> CacheEvent {
        CacheEvent::TagsInvalidated {
            tags: self.tags.clone(),
            keys: self.marked.clone(),
        }
    }
}

/// Warn about tags whose type was never declared. Returns the offenders.
pub fn report_unknown_tag_types<'a>(config: &ApiConfig, endpoint: &str, tags: &'a [Tag]) -> Vec<&'a Tag> {
    let unknown: Vec<&Tag> = tags
        .iter()
        .filter(|tag| !config.is_known_tag_type(&tag.tag_type))
        .collect();

    for tag in &unknown {
        warn!(
            "Endpoint '{}' uses tag type '{}' which is not declared in tag_types",
            endpoint, tag.tag_type
        );
    }

    unknown
}
