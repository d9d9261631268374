//! Cache entries and their transitions
//!
//! Transitions are plain methods on the entry so the reducer in
//! [`crate::cache::state`] stays a thin dispatcher. Completion transitions
//! return `false` when the event's request id does not match the entry's,
//! which is how superseded results get dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::cache::config::StalenessPolicy;
use crate::cache::tags::Tag;
use crate::cache::transport::TransportError;
use crate::cache::types::{QueryStatus, RequestId, SubscriberId};

/// Per-subscriber options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Poll the entry at this interval while subscribed
    pub polling_interval: Option<Duration>,

    /// Always refetch when this subscriber arrives
    pub force_refetch: bool,

    /// Overrides the API-wide mount staleness policy for this subscriber
    pub refetch_on_mount: Option<StalenessPolicy>,
}

impl SubscriptionOptions {
    pub fn polling(interval: Duration) -> Self {
        Self {
            polling_interval: Some(interval),
            ..Default::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force_refetch: true,
            ..Default::default()
        }
    }
}

/// The cached record of one query key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryCacheEntry {
    pub endpoint_name: String,

    /// Arguments the entry was last requested with
    pub original_args: Value,

    pub status: QueryStatus,

    /// Last successful result, kept across failed refetches
    pub data: Option<Value>,

    /// Last failure, cleared by the next success
    pub error: Option<TransportError>,

    /// Most recent outstanding or completed request
    pub request_id: Option<RequestId>,

    pub started_at: Option<DateTime<Utc>>,

    pub fulfilled_at: Option<DateTime<Utc>>,

    pub subscribers: HashMap<SubscriberId, SubscriptionOptions>,

    /// Tags provided by the last fulfillment
    pub provided_tags: BTreeSet<Tag>,

    /// Hit by an invalidation while nobody was subscribed
    pub invalidated: bool,
}

impl QueryCacheEntry {
    pub fn new(endpoint_name: impl Into<String>, original_args: Value) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            original_args,
            status: QueryStatus::Uninitialized,
            data: None,
            error: None,
            request_id: None,
            started_at: None,
            fulfilled_at: None,
            subscribers: HashMap::new(),
            provided_tags: BTreeSet::new(),
            invalidated: false,
        }
    }

    /// `uninitialized|fulfilled|rejected → pending`
    pub fn start(&mut self, request_id: RequestId, args: Value, at: DateTime<Utc>) {
        self.status = QueryStatus::Pending;
        self.request_id = Some(request_id);
        self.original_args = args;
        self.started_at = Some(at);
    }

    /// `pending → fulfilled`, only for the current request
    pub fn succeed(&mut self, request_id: RequestId, data: Value, at: DateTime<Utc>) -> bool {
        if !self.is_current(request_id) {
            return false;
        }
        self.status = QueryStatus::Fulfilled;
        self.data = Some(data);
        self.error = None;
        self.fulfilled_at = Some(at);
        self.invalidated = false;
        true
    }

    /// `pending → rejected`, only for the current request. Data is untouched.
    pub fn fail(&mut self, request_id: RequestId, error: TransportError) -> bool {
        if !self.is_current(request_id) {
            return false;
        }
        self.status = QueryStatus::Rejected;
        self.error = Some(error);
        true
    }

    pub fn is_current(&self, request_id: RequestId) -> bool {
        self.request_id == Some(request_id)
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Time elapsed since the last fulfillment, `None` if never fulfilled
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.fulfilled_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::from_secs(0)))
    }

    /// Smallest polling interval among current subscribers
    pub fn polling_interval(&self) -> Option<Duration> {
        self.subscribers
            .values()
            .filter_map(|options| options.polling_interval)
            .filter(|interval| !interval.is_zero())
            .min()
    }
}

/// The record of one mutation invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationCacheEntry {
    pub endpoint_name: String,
    pub original_args: Value,
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<TransportError>,
    pub request_id: RequestId,
    pub started_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl MutationCacheEntry {
    pub fn started(
        endpoint_name: impl Into<String>,
        original_args: Value,
        request_id: RequestId,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            endpoint_name: endpoint_name.into(),
            original_args,
            status: QueryStatus::Pending,
            data: None,
            error: None,
            request_id,
            started_at: at,
            fulfilled_at: None,
        }
    }

    pub fn succeed(&mut self, request_id: RequestId, data: Value, at: DateTime<Utc>) -> bool {
        if self.request_id != request_id {
            return false;
        }
        self.status = QueryStatus::Fulfilled;
        self.data = Some(data);
        self.error = None;
        self.fulfilled_at = Some(at);
        true
    }

    pub fn fail(&mut self, request_id: RequestId, error: TransportError) -> bool {
        if self.request_id != request_id {
            return false;
        }
        self.status = QueryStatus::Rejected;
        self.error = Some(error);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(request_id: RequestId) -> QueryCacheEntry {
        let mut entry = QueryCacheEntry::new("getPost", json!(5));
        entry.start(request_id, json!(5), Utc::now());
        entry
    }

    #[test]
    fn test_new_entry_is_uninitialized() {
        let entry = QueryCacheEntry::new("getPost", json!(5));
        assert_eq!(entry.status, QueryStatus::Uninitialized);
        assert!(!entry.has_data());
        assert_eq!(entry.subscriber_count(), 0);
        assert!(entry.age(Utc::now()).is_none());
    }

    #[test]
    fn test_success_for_current_request() {
        let id = RequestId::new();
        let mut entry = pending(id);
        assert_eq!(entry.status, QueryStatus::Pending);

        assert!(entry.succeed(id, json!("v1"), Utc::now()));
        assert_eq!(entry.status, QueryStatus::Fulfilled);
        assert_eq!(entry.data, Some(json!("v1")));
        assert!(entry.fulfilled_at.is_some());
    }

    #[test]
    fn test_superseded_result_is_rejected() {
        let first = RequestId::new();
        let second = RequestId::new();
        let mut entry = pending(first);
        entry.start(second, json!(5), Utc::now());

        assert!(!entry.succeed(first, json!("old"), Utc::now()));
        assert!(!entry.fail(first, TransportError::new("late")));
        assert_eq!(entry.status, QueryStatus::Pending);
        assert!(entry.data.is_none());
    }

    #[test]
    fn test_failure_keeps_previous_data() {
        let first = RequestId::new();
        let mut entry = pending(first);
        entry.succeed(first, json!("v1"), Utc::now());

        let second = RequestId::new();
        entry.start(second, json!(5), Utc::now());
        assert!(entry.fail(second, TransportError::new("boom")));

        assert_eq!(entry.status, QueryStatus::Rejected);
        assert_eq!(entry.data, Some(json!("v1")));
        assert_eq!(entry.error.as_ref().map(|e| e.message.as_str()), Some("boom"));
    }

    #[test]
    fn test_success_clears_error_and_invalidation() {
        let id = RequestId::new();
        let mut entry = pending(id);
        entry.fail(id, TransportError::new("boom"));
        entry.invalidated = true;

        let retry = RequestId::new();
        entry.start(retry, json!(5), Utc::now());
        entry.succeed(retry, json!("v2"), Utc::now());
        assert!(entry.error.is_none());
        assert!(!entry.invalidated);
    }

    #[test]
    fn test_polling_interval_is_minimum() {
        let mut entry = QueryCacheEntry::new("getPost", json!(5));
        entry
            .subscribers
            .insert(SubscriberId::new(), SubscriptionOptions::polling(Duration::from_secs(10)));
        entry
            .subscribers
            .insert(SubscriberId::new(), SubscriptionOptions::polling(Duration::from_secs(3)));
        entry
            .subscribers
            .insert(SubscriberId::new(), SubscriptionOptions::default());

        assert_eq!(entry.polling_interval(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_age() {
        let id = RequestId::new();
        let mut entry = pending(id);
        let fulfilled = Utc::now() - chrono::Duration::seconds(30);
        entry.succeed(id, json!(1), fulfilled);

        let age = entry.age(Utc::now()).unwrap();
        assert!(age >= Duration::from_secs(30));
    }

    #[test]
    fn test_mutation_entry_transitions() {
        let id = RequestId::new();
        let mut entry = MutationCacheEntry::started("addPost", json!({}), id, Utc::now());
        assert_eq!(entry.status, QueryStatus::Pending);
        assert!(!entry.succeed(RequestId::new(), json!(1), Utc::now()));
        assert!(entry.succeed(id, json!({"id": 1}), Utc::now()));
        assert_eq!(entry.status, QueryStatus::Fulfilled);
    }
}
