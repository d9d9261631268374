//! Subscription manager
//!
//! Counts subscribers per key, decides whether a new subscriber triggers a
//! fetch, and owns the per-key timers:
//! - eviction, armed when the last subscriber leaves
//! - polling, at the smallest interval any subscriber asked for

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::api::coordinator::{QueryRequest, RequestCoordinator};
use crate::api::store::{CacheStore, EvictionTimer, PollTimer, Shared};
use crate::cache::{
    config::StalenessPolicy,
    entry::{QueryCacheEntry, SubscriptionOptions},
    state::CacheEvent,
    types::{CacheKey, QueryStatus, SubscriberId},
};
use crate::error::Result;

/// A registered subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub key: CacheKey,
    pub subscriber: SubscriberId,
    /// Request started or joined by subscribing, if any
    pub request: Option<QueryRequest>,
}

/// Whether a subscriber arriving now should trigger a fetch
pub fn needs_fetch_on_subscribe(
    entry: Option<&QueryCacheEntry>,
    options: &SubscriptionOptions,
    default_policy: StalenessPolicy,
    now: DateTime<Utc>,
) -> bool {
    let Some(entry) = entry else {
        return true;
    };
    if entry.status == QueryStatus::Pending {
        return false;
    }
    let Some(age) = entry.age(now) else {
        return true;
    };
    if entry.invalidated || options.force_refetch {
        return true;
    }
    options
        .refetch_on_mount
        .unwrap_or(default_policy)
        .is_stale(age)
}

#[derive(Clone)]
pub(crate) struct SubscriptionManager {
    shared: Arc<Shared>,
    coordinator: RequestCoordinator,
}

impl SubscriptionManager {
    pub fn new(shared: Arc<Shared>, coordinator: RequestCoordinator) -> Self {
        Self { shared, coordinator }
    }

    pub async fn subscribe(
        &self,
        endpoint: &str,
        args: Value,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.shared.endpoints.query(endpoint)?;
        let key = self.shared.resolve_key(endpoint, &args)?;

        let mut store = self.shared.store.write().await;
        Ok(self.add_subscriber(&mut store, key, endpoint, args, subscriber, options, false))
    }

    /// Register a subscriber. Must be called with the store locked.
    #[allow(clippy::too_many_arguments)]
    pub fn add_subscriber(
        &self,
        store: &mut CacheStore,
        key: CacheKey,
        endpoint: &str,
        args: Value,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
        force: bool,
    ) -> Subscription {
        if store.timers.cancel_eviction(&key) {
            debug!("Eviction of {} cancelled by new subscriber", key);
        }

        let fetch = force
            || needs_fetch_on_subscribe(
                store.state.query(&key),
                &options,
                self.shared.config.refetch_on_mount,
                Utc::now(),
            );
        let pending = store
            .state
            .query(&key)
            .is_some_and(|entry| entry.status == QueryStatus::Pending);

        self.shared.dispatch(
            store,
            CacheEvent::SubscriptionAdded {
                key: key.clone(),
                endpoint: endpoint.to_string(),
                args: args.clone(),
                subscriber,
                options,
            },
        );

        // A pending entry is joined, never restarted
        let request = if fetch || pending {
            Some(
                self.coordinator
                    .start_query(store, key.clone(), endpoint, args, force && !pending),
            )
        } else {
            None
        };

        self.update_polling(store, &key);

        Subscription {
            key,
            subscriber,
            request,
        }
    }

    pub async fn unsubscribe(&self, key: &CacheKey, subscriber: SubscriberId) -> bool {
        let mut store = self.shared.store.write().await;
        self.remove_subscriber(&mut store, key, subscriber)
    }

    /// Must be called with the store locked
    pub fn remove_subscriber(&self, store: &mut CacheStore, key: &CacheKey, subscriber: SubscriberId) -> bool {
        let known = store
            .state
            .query(key)
            .is_some_and(|entry| entry.subscribers.contains_key(&subscriber));
        if !known {
            debug!("Unsubscribe of unknown subscriber {} on {}", subscriber, key);
            return false;
        }

        self.shared.dispatch(
            store,
            CacheEvent::SubscriptionRemoved {
                key: key.clone(),
                subscriber,
            },
        );
        self.update_polling(store, key);

        let unused = store
            .state
            .query(key)
            .is_some_and(|entry| !entry.has_subscribers());
        if unused {
            schedule_eviction(&self.shared, store, key);
        }
        true
    }

    pub async fn update_options(
        &self,
        key: &CacheKey,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> bool {
        let mut store = self.shared.store.write().await;
        let known = store
            .state
            .query(key)
            .is_some_and(|entry| entry.subscribers.contains_key(&subscriber));
        if !known {
            return false;
        }

        self.shared.dispatch(
            &mut store,
            CacheEvent::SubscriptionUpdated {
                key: key.clone(),
                subscriber,
                options,
            },
        );
        self.update_polling(&mut store, key);
        true
    }

    /// Move a subscriber from one argument set to another
    pub async fn change_args(
        &self,
        endpoint: &str,
        subscriber: SubscriberId,
        old_args: &Value,
        new_args: Value,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.shared.endpoints.query(endpoint)?;
        let old_key = self.shared.resolve_key(endpoint, old_args)?;
        let new_key = self.shared.resolve_key(endpoint, &new_args)?;

        let mut store = self.shared.store.write().await;
        if old_key == new_key {
            let subscribed = store
                .state
                .query(&new_key)
                .is_some_and(|entry| entry.subscribers.contains_key(&subscriber));
            if subscribed {
                return Ok(Subscription {
                    key: new_key,
                    subscriber,
                    request: None,
                });
            }
        }

        self.remove_subscriber(&mut store, &old_key, subscriber);
        let force = self.shared.config.refetch_on_arg_change;
        Ok(self.add_subscriber(&mut store, new_key, endpoint, new_args, subscriber, options, force))
    }

    /// Keep exactly one poll timer per key at the minimum requested interval
    fn update_polling(&self, store: &mut CacheStore, key: &CacheKey) {
        let interval = store.state.query(key).and_then(|entry| entry.polling_interval());

        if let (Some(interval), Some(timer)) = (interval, store.timers.polling.get(key)) {
            if timer.interval == interval {
                return;
            }
        }
        store.timers.cancel_polling(key);

        let Some(interval) = interval else {
            return;
        };

        let shared = self.shared.clone();
        let coordinator = self.coordinator.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            poll(shared, coordinator, timer_key, interval).await;
        });
        debug!("Polling {} every {:?}", key, interval);
        store
            .timers
            .polling
            .insert(key.clone(), PollTimer { interval, handle });
    }
}

/// Arm (or re-arm) the eviction timer of `key`. Must be called with the store locked.
pub(crate) fn schedule_eviction(shared: &Arc<Shared>, store: &mut CacheStore, key: &CacheKey) {
    let retention = store
        .state
        .query(key)
        .and_then(|entry| shared.endpoints.query(&entry.endpoint_name).ok())
        .and_then(|definition| definition.keep_unused_data_for)
        .unwrap_or(shared.config.keep_unused_data_for);

    let generation = store.timers.next_generation();
    let task_shared = shared.clone();
    let timer_key = key.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        evict(task_shared, timer_key, generation).await;
    });

    debug!("Scheduled eviction of {} in {:?}", key, retention);
    if let Some(previous) = store
        .timers
        .eviction
        .insert(key.clone(), EvictionTimer { generation, handle })
    {
        previous.handle.abort();
    }
}

/// Arm eviction for an entry nobody subscribed to, unless a timer is already running
pub(crate) fn evict_when_unused(shared: &Arc<Shared>, store: &mut CacheStore, key: &CacheKey) {
    let unused = store
        .state
        .query(key)
        .is_some_and(|entry| !entry.has_subscribers());
    if unused && !store.timers.eviction.contains_key(key) {
        schedule_eviction(shared, store, key);
    }
}

async fn evict(shared: Arc<Shared>, key: CacheKey, generation: u64) {
    let mut store = shared.store.write().await;

    let current = store
        .timers
        .eviction
        .get(&key)
        .is_some_and(|timer| timer.generation == generation);
    if !current {
        return;
    }
    store.timers.eviction.remove(&key);

    if store.state.query(&key).is_some_and(|entry| entry.has_subscribers()) {
        return;
    }
    // Re-armed when the outstanding request settles
    if store.in_flight.contains_key(&key) {
        debug!("Eviction of {} deferred, request in flight", key);
        return;
    }

    if shared.remove_query(&mut store, &key) {
        store.stats.evictions += 1;
        info!("[{}] Evicted unused cache entry: {}", shared.config.reducer_path, key);
    }
}

async fn poll(shared: Arc<Shared>, coordinator: RequestCoordinator, key: CacheKey, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let mut store = shared.store.write().await;
        let still_polling = store
            .state
            .query(&key)
            .and_then(|entry| entry.polling_interval())
            .is_some();
        if !still_polling {
            return;
        }
        debug!("Polling tick for {}", key);
        coordinator.refetch(&mut store, &key, true);
    }
}
