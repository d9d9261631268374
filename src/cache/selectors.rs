//! Read-only projections of cache entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::entry::{MutationCacheEntry, QueryCacheEntry};
use crate::cache::state::CacheState;
use crate::cache::transport::TransportError;
use crate::cache::types::{CacheKey, QueryStatus, RequestId};

/// What a consumer sees of one query key
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryView {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<TransportError>,
    pub is_uninitialized: bool,
    /// Pending with no prior data
    pub is_loading: bool,
    /// Pending, whether or not stale data is present
    pub is_fetching: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub request_id: Option<RequestId>,
}

impl QueryView {
    /// Projection of a key with no entry
    pub fn uninitialized() -> Self {
        Self {
            is_uninitialized: true,
            ..Default::default()
        }
    }

    fn from_entry(entry: &QueryCacheEntry) -> Self {
        let status = entry.status;
        Self {
            status,
            data: entry.data.clone(),
            error: entry.error.clone(),
            is_uninitialized: status == QueryStatus::Uninitialized,
            is_loading: status == QueryStatus::Pending && entry.data.is_none(),
            is_fetching: status == QueryStatus::Pending,
            is_success: status == QueryStatus::Fulfilled,
            is_error: status == QueryStatus::Rejected,
            fulfilled_at: entry.fulfilled_at,
            request_id: entry.request_id,
        }
    }
}

/// What the invoker of a mutation sees
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MutationView {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<TransportError>,
    pub is_uninitialized: bool,
    pub is_loading: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl MutationView {
    pub fn uninitialized() -> Self {
        Self {
            is_uninitialized: true,
            ..Default::default()
        }
    }

    fn from_entry(entry: &MutationCacheEntry) -> Self {
        let status = entry.status;
        Self {
            status,
            data: entry.data.clone(),
            error: entry.error.clone(),
            is_uninitialized: status == QueryStatus::Uninitialized,
            is_loading: status == QueryStatus::Pending,
            is_success: status == QueryStatus::Fulfilled,
            is_error: status == QueryStatus::Rejected,
            started_at: Some(entry.started_at),
            fulfilled_at: entry.fulfilled_at,
        }
    }
}

pub fn select_query(state: &CacheState, key: &CacheKey) -> QueryView {
    state
        .query(key)
        .map(QueryView::from_entry)
        .unwrap_or_else(QueryView::uninitialized)
}

pub fn select_mutation(state: &CacheState, request_id: &RequestId) -> MutationView {
    state
        .mutation(request_id)
        .map(MutationView::from_entry)
        .unwrap_or_else(MutationView::uninitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::state::CacheEvent;
    use serde_json::json;

    fn start(state: &mut CacheState, key: &CacheKey) -> RequestId {
        let request_id = RequestId::new();
        state.apply(&CacheEvent::QueryStarted {
            key: key.clone(),
            endpoint: "getPost".to_string(),
            args: json!(1),
            request_id,
            at: Utc::now(),
        });
        request_id
    }

    #[test]
    fn test_missing_key_is_uninitialized() {
        let state = CacheState::new();
        let view = select_query(&state, &CacheKey::from("nope"));
        assert_eq!(view.status, QueryStatus::Uninitialized);
        assert!(view.is_uninitialized);
        assert!(!view.is_loading && !view.is_fetching);
        assert!(state.queries.is_empty());
    }

    #[test]
    fn test_loading_versus_fetching() {
        let mut state = CacheState::new();
        let key = CacheKey::from("getPost(1)");

        let first = start(&mut state, &key);
        let view = select_query(&state, &key);
        assert!(view.is_loading && view.is_fetching);

        state.apply(&CacheEvent::QuerySucceeded {
            key: key.clone(),
            request_id: first,
            data: json!("v1"),
            provided_tags: vec![],
            at: Utc::now(),
        });
        let view = select_query(&state, &key);
        assert!(view.is_success);
        assert_eq!(view.data, Some(json!("v1")));

        start(&mut state, &key);
        let view = select_query(&state, &key);
        assert!(!view.is_loading);
        assert!(view.is_fetching);
        assert_eq!(view.data, Some(json!("v1")));
    }

    #[test]
    fn test_error_view_keeps_data() {
        let mut state = CacheState::new();
        let key = CacheKey::from("getPost(1)");
        let first = start(&mut state, &key);
        state.apply(&CacheEvent::QuerySucceeded {
            key: key.clone(),
            request_id: first,
            data: json!("v1"),
            provided_tags: vec![],
            at: Utc::now(),
        });
        let second = start(&mut state, &key);
        state.apply(&CacheEvent::QueryFailed {
            key: key.clone(),
            request_id: second,
            error: TransportError::new("boom").with_status(500),
        });

        let view = select_query(&state, &key);
        assert!(view.is_error);
        assert_eq!(view.data, Some(json!("v1")));
        assert_eq!(view.error.unwrap().status, Some(500));
    }

    #[test]
    fn test_mutation_view() {
        let mut state = CacheState::new();
        let request_id = RequestId::new();
        assert!(select_mutation(&state, &request_id).is_uninitialized);

        state.apply(&CacheEvent::MutationStarted {
            request_id,
            endpoint: "addPost".to_string(),
            args: json!({"title": "t"}),
            at: Utc::now(),
        });
        assert!(select_mutation(&state, &request_id).is_loading);

        state.apply(&CacheEvent::MutationSucceeded {
            request_id,
            data: json!({"id": 1}),
            at: Utc::now(),
        });
        let view = select_mutation(&state, &request_id);
        assert!(view.is_success);
        assert_eq!(view.data, Some(json!({"id": 1})));
    }
}
