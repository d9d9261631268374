//! The cache state tree and its reducer
//!
//! Every change to the cache goes through [`CacheState::apply`]. The runtime
//! in [`crate::api`] applies events under a single lock; a host with its own
//! state container can drive the same reducer through [`reduce`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::cache::entry::{MutationCacheEntry, QueryCacheEntry, SubscriptionOptions};
use crate::cache::tags::{Tag, TagIndex};
use crate::cache::transport::TransportError;
use crate::cache::types::{CacheKey, QueryStatus, RequestId, SubscriberId};

/// A direct change to cached data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum QueryPatch {
    /// JSON merge patch (RFC 7386)
    Merge(Value),
    /// Replace the data wholesale
    Replace(Value),
}

/// Events accepted by the reducer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    QueryStarted {
        key: CacheKey,
        endpoint: String,
        args: Value,
        request_id: RequestId,
        at: DateTime<Utc>,
    },
    QuerySucceeded {
        key: CacheKey,
        request_id: RequestId,
        data: Value,
        provided_tags: Vec<Tag>,
        at: DateTime<Utc>,
    },
    QueryFailed {
        key: CacheKey,
        request_id: RequestId,
        error: TransportError,
    },
    MutationStarted {
        request_id: RequestId,
        endpoint: String,
        args: Value,
        at: DateTime<Utc>,
    },
    MutationSucceeded {
        request_id: RequestId,
        data: Value,
        at: DateTime<Utc>,
    },
    MutationFailed {
        request_id: RequestId,
        error: TransportError,
    },
    MutationRemoved {
        request_id: RequestId,
    },
    SubscriptionAdded {
        key: CacheKey,
        endpoint: String,
        args: Value,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    },
    SubscriptionUpdated {
        key: CacheKey,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    },
    SubscriptionRemoved {
        key: CacheKey,
        subscriber: SubscriberId,
    },
    QueryRemoved {
        key: CacheKey,
    },
    QueryResultPatched {
        key: CacheKey,
        patch: QueryPatch,
        at: DateTime<Utc>,
    },
    /// Marks unsubscribed entries among `keys` as possibly stale
    TagsInvalidated {
        tags: Vec<Tag>,
        keys: Vec<CacheKey>,
    },
    FocusChanged {
        focused: bool,
    },
    OnlineChanged {
        online: bool,
    },
    Reset,
}

/// Change notification emitted when an entry changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheNotification {
    Query { key: CacheKey, status: QueryStatus },
    QueryRemoved { key: CacheKey },
    Mutation { request_id: RequestId, status: QueryStatus },
    MutationRemoved { request_id: RequestId },
}

/// What applying one event did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub notifications: Vec<CacheNotification>,
    /// A completion was discarded by the request id guard
    pub dropped: bool,
}

impl Applied {
    fn notify(notification: CacheNotification) -> Self {
        Self {
            notifications: vec![notification],
            dropped: false,
        }
    }

    fn dropped() -> Self {
        Self {
            notifications: Vec::new(),
            dropped: true,
        }
    }
}

/// Host environment flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags {
    pub online: bool,
    pub focused: bool,
}

impl Default for StateFlags {
    fn default() -> Self {
        Self {
            online: true,
            focused: true,
        }
    }
}

/// The whole cache: query entries, mutation entries and the tag index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheState {
    pub queries: HashMap<CacheKey, QueryCacheEntry>,
    pub mutations: HashMap<RequestId, MutationCacheEntry>,
    pub provided: TagIndex,
    pub flags: StateFlags,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self, key: &CacheKey) -> Option<&QueryCacheEntry> {
        self.queries.get(key)
    }

    pub fn mutation(&self, request_id: &RequestId) -> Option<&MutationCacheEntry> {
        self.mutations.get(request_id)
    }

    /// Keys with at least one subscriber
    pub fn subscribed_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .queries
            .iter()
            .filter(|(_, entry)| entry.has_subscribers())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Keys currently providing any of `tags`
    pub fn affected_keys(&self, tags: &[Tag]) -> BTreeSet<CacheKey> {
        self.provided.affected_keys(tags)
    }

    /// Apply one event
    pub fn apply(&mut self, event: &CacheEvent) -> Applied {
        match event {
            CacheEvent::QueryStarted {
                key,
                endpoint,
                args,
                request_id,
                at,
            } => {
                let entry = self
                    .queries
                    .entry(key.clone())
                    .or_insert_with(|| QueryCacheEntry::new(endpoint.clone(), args.clone()));
                entry.start(*request_id, args.clone(), *at);
                Applied::notify(CacheNotification::Query {
                    key: key.clone(),
                    status: entry.status,
                })
            }

            CacheEvent::QuerySucceeded {
                key,
                request_id,
                data,
                provided_tags,
                at,
            } => {
                let Some(entry) = self.queries.get_mut(key) else {
                    debug!("Dropping result for removed entry: {}", key);
                    return Applied::dropped();
                };
                if !entry.succeed(*request_id, data.clone(), *at) {
                    debug!("Dropping superseded result for {} ({})", key, request_id);
                    return Applied::dropped();
                }
                let new_tags: BTreeSet<Tag> = provided_tags.iter().cloned().collect();
                let old_tags = std::mem::replace(&mut entry.provided_tags, new_tags);
                self.provided.replace(key, &old_tags, &entry.provided_tags);
                Applied::notify(CacheNotification::Query {
                    key: key.clone(),
                    status: QueryStatus::Fulfilled,
                })
            }

            CacheEvent::QueryFailed {
                key,
                request_id,
                error,
            } => {
                let Some(entry) = self.queries.get_mut(key) else {
                    debug!("Dropping failure for removed entry: {}", key);
                    return Applied::dropped();
                };
                if !entry.fail(*request_id, error.clone()) {
                    debug!("Dropping superseded failure for {} ({})", key, request_id);
                    return Applied::dropped();
                }
                Applied::notify(CacheNotification::Query {
                    key: key.clone(),
                    status: QueryStatus::Rejected,
                })
            }

            CacheEvent::MutationStarted {
                request_id,
                endpoint,
                args,
                at,
            } => {
                self.mutations.insert(
                    *request_id,
                    MutationCacheEntry::started(endpoint.clone(), args.clone(), *request_id, *at),
                );
                Applied::notify(CacheNotification::Mutation {
                    request_id: *request_id,
                    status: QueryStatus::Pending,
                })
            }

            CacheEvent::MutationSucceeded {
                request_id,
                data,
                at,
            } => {
                let Some(entry) = self.mutations.get_mut(request_id) else {
                    return Applied::dropped();
                };
                if !entry.succeed(*request_id, data.clone(), *at) {
                    return Applied::dropped();
                }
                Applied::notify(CacheNotification::Mutation {
                    request_id: *request_id,
                    status: QueryStatus::Fulfilled,
                })
            }

            CacheEvent::MutationFailed { request_id, error } => {
                let Some(entry) = self.mutations.get_mut(request_id) else {
                    return Applied::dropped();
                };
                if !entry.fail(*request_id, error.clone()) {
                    return Applied::dropped();
                }
                Applied::notify(CacheNotification::Mutation {
                    request_id: *request_id,
                    status: QueryStatus::Rejected,
                })
            }

            CacheEvent::MutationRemoved { request_id } => {
                if self.mutations.remove(request_id).is_some() {
                    Applied::notify(CacheNotification::MutationRemoved {
                        request_id: *request_id,
                    })
                } else {
                    Applied::default()
                }
            }

            CacheEvent::SubscriptionAdded {
                key,
                endpoint,
                args,
                subscriber,
                options,
            } => {
                self.queries
                    .entry(key.clone())
                    .or_insert_with(|| QueryCacheEntry::new(endpoint.clone(), args.clone()))
                    .subscribers
                    .insert(*subscriber, *options);
                Applied::default()
            }

            CacheEvent::SubscriptionUpdated {
                key,
                subscriber,
                options,
            } => {
                if let Some(existing) = self
                    .queries
                    .get_mut(key)
                    .and_then(|entry| entry.subscribers.get_mut(subscriber))
                {
                    *existing = *options;
                }
                Applied::default()
            }

            CacheEvent::SubscriptionRemoved { key, subscriber } => {
                if let Some(entry) = self.queries.get_mut(key) {
                    entry.subscribers.remove(subscriber);
                }
                Applied::default()
            }

            CacheEvent::QueryRemoved { key } => match self.queries.remove(key) {
                Some(entry) => {
                    self.provided.remove_key(key, &entry.provided_tags);
                    Applied::notify(CacheNotification::QueryRemoved { key: key.clone() })
                }
                None => Applied::default(),
            },

            CacheEvent::QueryResultPatched { key, patch, at } => {
                let Some(entry) = self.queries.get_mut(key) else {
                    return Applied::default();
                };
                let Some(data) = entry.data.as_mut() else {
                    debug!("Ignoring patch for entry without data: {}", key);
                    return Applied::default();
                };
                match patch {
                    // An empty delta only refreshes the entry
                    QueryPatch::Merge(Value::Object(delta)) if delta.is_empty() => {}
                    QueryPatch::Merge(delta) => merge_patch(data, delta),
                    QueryPatch::Replace(value) => *data = value.clone(),
                }
                entry.fulfilled_at = Some(*at);
                Applied::notify(CacheNotification::Query {
                    key: key.clone(),
                    status: entry.status,
                })
            }

            CacheEvent::TagsInvalidated { keys, .. } => {
                for key in keys {
                    if let Some(entry) = self.queries.get_mut(key) {
                        if !entry.has_subscribers() {
                            entry.invalidated = true;
                        }
                    }
                }
                Applied::default()
            }

            CacheEvent::FocusChanged { focused } => {
                self.flags.focused = *focused;
                Applied::default()
            }

            CacheEvent::OnlineChanged { online } => {
                self.flags.online = *online;
                Applied::default()
            }

            CacheEvent::Reset => {
                let mut notifications: Vec<CacheNotification> = self
                    .queries
                    .drain()
                    .map(|(key, _)| CacheNotification::QueryRemoved { key })
                    .collect();
                notifications.extend(
                    self.mutations
                        .drain()
                        .map(|(request_id, _)| CacheNotification::MutationRemoved { request_id }),
                );
                self.provided.clear();
                Applied {
                    notifications,
                    dropped: false,
                }
            }
        }
    }
}

/// Reducer entry point for hosts that own the state tree
pub fn reduce(mut state: CacheState, event: &CacheEvent) -> CacheState {
    state.apply(event);
    state
}

/// Apply a JSON merge patch (RFC 7386) in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (name, value) in patch_map {
            if value.is_null() {
                target_map.remove(name);
            } else {
                merge_patch(target_map.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> CacheKey {
        CacheKey::from("getPost(5)")
    }

    fn started(state: &mut CacheState) -> RequestId {
        let request_id = RequestId::new();
        state.apply(&CacheEvent::QueryStarted {
            key: key(),
            endpoint: "getPost".to_string(),
            args: json!(5),
            request_id,
            at: Utc::now(),
        });
        request_id
    }

    fn succeeded(state: &mut CacheState, request_id: RequestId, data: Value, tags: Vec<Tag>) -> Applied {
        state.apply(&CacheEvent::QuerySucceeded {
            key: key(),
            request_id,
            data,
            provided_tags: tags,
            at: Utc::now(),
        })
    }

    #[test]
    fn test_started_creates_entry_lazily() {
        let mut state = CacheState::new();
        assert!(state.query(&key()).is_none());

        started(&mut state);
        assert_eq!(state.query(&key()).unwrap().status, QueryStatus::Pending);
    }

    #[test]
    fn test_out_of_order_completion() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        let b = started(&mut state);

        let applied = succeeded(&mut state, b, json!("b"), vec![]);
        assert!(!applied.dropped);
        let applied = succeeded(&mut state, a, json!("a"), vec![]);
        assert!(applied.dropped);

        let entry = state.query(&key()).unwrap();
        assert_eq!(entry.data, Some(json!("b")));
        assert_eq!(entry.request_id, Some(b));
    }

    #[test]
    fn test_success_updates_tag_index() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        succeeded(&mut state, a, json!(1), vec![Tag::with_id("Post", 5), Tag::of_type("Feed")]);
        assert_eq!(state.affected_keys(&[Tag::of_type("Feed")]).len(), 1);

        let b = started(&mut state);
        succeeded(&mut state, b, json!(2), vec![Tag::with_id("Post", 5)]);
        assert!(state.affected_keys(&[Tag::of_type("Feed")]).is_empty());
        assert_eq!(state.affected_keys(&[Tag::with_id("Post", 5)]).len(), 1);
    }

    #[test]
    fn test_removed_entry_drops_results_and_tags() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        succeeded(&mut state, a, json!(1), vec![Tag::with_id("Post", 5)]);

        let b = started(&mut state);
        let applied = state.apply(&CacheEvent::QueryRemoved { key: key() });
        assert_eq!(
            applied.notifications,
            vec![CacheNotification::QueryRemoved { key: key() }]
        );
        assert!(state.provided.is_empty());

        assert!(succeeded(&mut state, b, json!(2), vec![]).dropped);
        assert!(state.query(&key()).is_none());
    }

    #[test]
    fn test_empty_merge_patch_keeps_data_and_notifies_once() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        succeeded(&mut state, a, json!({"title": "hello"}), vec![]);
        let before = state.query(&key()).unwrap().fulfilled_at;

        let at = Utc::now() + chrono::Duration::seconds(1);
        let applied = state.apply(&CacheEvent::QueryResultPatched {
            key: key(),
            patch: QueryPatch::Merge(json!({})),
            at,
        });

        assert_eq!(applied.notifications.len(), 1);
        let entry = state.query(&key()).unwrap();
        assert_eq!(entry.data, Some(json!({"title": "hello"})));
        assert_eq!(entry.fulfilled_at, Some(at));
        assert_ne!(entry.fulfilled_at, before);
    }

    #[test]
    fn test_empty_merge_patch_keeps_scalar_and_array_data() {
        for original in [json!("v1"), json!([1, 2, 3])] {
            let mut state = CacheState::new();
            let a = started(&mut state);
            succeeded(&mut state, a, original.clone(), vec![]);

            let applied = state.apply(&CacheEvent::QueryResultPatched {
                key: key(),
                patch: QueryPatch::Merge(json!({})),
                at: Utc::now(),
            });
            assert_eq!(applied.notifications.len(), 1);
            assert_eq!(state.query(&key()).unwrap().data, Some(original));
        }
    }

    #[test]
    fn test_object_patch_over_scalar_data_replaces_it() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        succeeded(&mut state, a, json!("v1"), vec![]);

        state.apply(&CacheEvent::QueryResultPatched {
            key: key(),
            patch: QueryPatch::Merge(json!({"title": "t", "gone": null})),
            at: Utc::now(),
        });
        assert_eq!(state.query(&key()).unwrap().data, Some(json!({"title": "t"})));
    }

    #[test]
    fn test_mutation_completions_guarded() {
        let mut state = CacheState::new();
        let request_id = RequestId::new();

        let unknown = state.apply(&CacheEvent::MutationFailed {
            request_id,
            error: TransportError::new("boom"),
        });
        assert!(unknown.dropped);

        state.apply(&CacheEvent::MutationStarted {
            request_id,
            endpoint: "addPost".to_string(),
            args: json!({}),
            at: Utc::now(),
        });
        let failed = state.apply(&CacheEvent::MutationFailed {
            request_id,
            error: TransportError::new("boom"),
        });
        assert_eq!(
            failed.notifications,
            vec![CacheNotification::Mutation {
                request_id,
                status: QueryStatus::Rejected
            }]
        );

        let stray = state.apply(&CacheEvent::MutationSucceeded {
            request_id: RequestId::new(),
            data: json!(2),
            at: Utc::now(),
        });
        assert!(stray.dropped);
    }

    #[test]
    fn test_patch_without_data_is_noop() {
        let mut state = CacheState::new();
        let patch = CacheEvent::QueryResultPatched {
            key: key(),
            patch: QueryPatch::Replace(json!(1)),
            at: Utc::now(),
        };
        assert!(state.apply(&patch).notifications.is_empty());
        assert!(state.query(&key()).is_none());

        started(&mut state);
        assert!(state.apply(&patch).notifications.is_empty());
        assert!(state.query(&key()).unwrap().data.is_none());
    }

    #[test]
    fn test_merge_patch_semantics() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut target, &json!({"a": null, "b": {"c": 5}, "e": [1]}));
        assert_eq!(target, json!({"b": {"c": 5, "d": 3}, "e": [1]}));

        let mut scalar = json!(1);
        merge_patch(&mut scalar, &json!("x"));
        assert_eq!(scalar, json!("x"));
    }

    #[test]
    fn test_subscription_events() {
        let mut state = CacheState::new();
        let subscriber = SubscriberId::new();
        state.apply(&CacheEvent::SubscriptionAdded {
            key: key(),
            endpoint: "getPost".to_string(),
            args: json!(5),
            subscriber,
            options: SubscriptionOptions::default(),
        });
        assert_eq!(state.subscribed_keys(), vec![key()]);
        assert_eq!(state.query(&key()).unwrap().status, QueryStatus::Uninitialized);

        // removing twice never underflows
        for _ in 0..2 {
            state.apply(&CacheEvent::SubscriptionRemoved {
                key: key(),
                subscriber,
            });
        }
        assert_eq!(state.query(&key()).unwrap().subscriber_count(), 0);
    }

    #[test]
    fn test_invalidation_marks_only_unsubscribed() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        succeeded(&mut state, a, json!(1), vec![Tag::with_id("Post", 5)]);

        state.apply(&CacheEvent::TagsInvalidated {
            tags: vec![Tag::of_type("Post")],
            keys: vec![key()],
        });
        assert!(state.query(&key()).unwrap().invalidated);
    }

    #[test]
    fn test_reduce_and_reset() {
        let state = CacheState::new();
        let state = reduce(
            state,
            &CacheEvent::MutationStarted {
                request_id: RequestId::new(),
                endpoint: "addPost".to_string(),
                args: json!({}),
                at: Utc::now(),
            },
        );
        assert_eq!(state.mutations.len(), 1);

        let state = reduce(state, &CacheEvent::OnlineChanged { online: false });
        assert!(!state.flags.online);

        let state = reduce(state, &CacheEvent::Reset);
        assert!(state.mutations.is_empty());
    }

    #[test]
    fn test_state_serializes() {
        let mut state = CacheState::new();
        let a = started(&mut state);
        succeeded(&mut state, a, json!(1), vec![Tag::with_id("Post", 5)]);

        let json = serde_json::to_string(&state).unwrap();
        let restored: CacheState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.query(&key()).unwrap().data, Some(json!(1)));
        assert_eq!(restored.affected_keys(&[Tag::of_type("Post")]).len(), 1);
    }
}
