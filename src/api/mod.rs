//! # Query API runtime
//!
//! Composes the cache core with the async machinery: a request coordinator
//! talking to the transport, a subscription manager owning eviction and
//! polling timers, and a router for focus/connectivity signals. All of them
//! share one locked store; transport calls and timers run in spawned tasks and
//! come back through reducer events.
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query::api::{ApiBuilder, InitiateOptions};
//! use ouroboros_query::cache::{transport_fn, ApiConfig, QueryDefinition, Tag};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let api = ApiBuilder::new(ApiConfig::default())
//!     .query(QueryDefinition::new("getPost").provides_tags(vec![Tag::of_type("Post")]))
//!     .transport(transport_fn(|request, _signal| async move {
//!         Ok(json!({ "id": request.args }))
//!     }))
//!     .finalize()?;
//!
//! let request = api.initiate("getPost", json!(1), InitiateOptions::default()).await?;
//! let view = api.settled(&request.key).await;
//! assert!(view.is_success);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod coordinator;
pub mod lifecycle;
mod store;
pub mod subscriptions;

pub use builder::{ApiBuilder, ApiHandle, ApiModule};
pub use coordinator::{InitiateOptions, MutationOptions, MutationRequest, PrefetchOptions, QueryRequest};
pub use lifecycle::LifecycleSignal;
pub use subscriptions::{needs_fetch_on_subscribe, Subscription};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::{
    config::ApiConfig,
    endpoint::Endpoints,
    entry::SubscriptionOptions,
    invalidation::InvalidationReason,
    key::KeyResolver,
    selectors::{select_mutation, select_query, MutationView, QueryView},
    state::{CacheEvent, CacheNotification, CacheState, QueryPatch},
    tags::Tag,
    transport::Transport,
    types::{CacheKey, CacheStats, RequestId, SubscriberId},
};
use crate::error::Result;
use coordinator::RequestCoordinator;
use lifecycle::LifecycleRouter;
use store::Shared;
use subscriptions::SubscriptionManager;

/// Previous and next data of an [`Api::update_query_result`] call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchCollection {
    pub key: CacheKey,
    pub previous: Value,
    pub next: Value,
}

impl PatchCollection {
    /// Patch restoring the previous data
    pub fn inverse(&self) -> QueryPatch {
        QueryPatch::Replace(self.previous.clone())
    }
}

/// A finalized query cache
#[derive(Clone)]
pub struct Api {
    shared: Arc<Shared>,
    coordinator: RequestCoordinator,
    subscriptions: SubscriptionManager,
    lifecycle: LifecycleRouter,
    modules: Arc<[ApiModule]>,
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api")
            .field("reducer_path", &self.shared.config.reducer_path)
            .field("endpoints", &self.shared.endpoints.len())
            .field("modules", &self.modules)
            .finish()
    }
}

impl Api {
    /// Start configuring a new API
    pub fn builder(config: ApiConfig) -> ApiBuilder {
        ApiBuilder::new(config)
    }

    pub(crate) fn compose(
        config: ApiConfig,
        endpoints: Endpoints,
        resolver: Arc<dyn KeyResolver>,
        transport: Arc<dyn Transport>,
        modules: Vec<ApiModule>,
    ) -> Self {
        let shared = Arc::new(Shared::new(config, endpoints, resolver, transport));
        let coordinator = RequestCoordinator::new(shared.clone());
        let subscriptions = SubscriptionManager::new(shared.clone(), coordinator.clone());
        let lifecycle = LifecycleRouter::new(shared.clone(), coordinator.clone());

        Self {
            shared,
            coordinator,
            subscriptions,
            lifecycle,
            modules: modules.into(),
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.shared.config
    }

    pub fn modules(&self) -> &[ApiModule] {
        &self.modules
    }

    pub fn has_module(&self, module: ApiModule) -> bool {
        self.modules.contains(&module)
    }

    pub fn resolve_key(&self, endpoint: &str, args: &Value) -> Result<CacheKey> {
        self.shared.resolve_key(endpoint, args)
    }

    /// Start (or join) the query for `(endpoint, args)`
    pub async fn initiate(&self, endpoint: &str, args: Value, options: InitiateOptions) -> Result<QueryRequest> {
        let Some((subscriber, subscription)) = options.subscribe else {
            return self
                .coordinator
                .initiate(endpoint, args, options.force_refetch)
                .await;
        };

        self.shared.endpoints.query(endpoint)?;
        let key = self.shared.resolve_key(endpoint, &args)?;

        let mut store = self.shared.store.write().await;
        let subscribed = self.subscriptions.add_subscriber(
            &mut store,
            key.clone(),
            endpoint,
            args.clone(),
            subscriber,
            subscription,
            options.force_refetch,
        );
        Ok(match subscribed.request {
            Some(request) => request,
            // Cached data satisfied the subscriber
            None => QueryRequest {
                request_id: store
                    .state
                    .query(&key)
                    .and_then(|entry| entry.request_id)
                    .unwrap_or_default(),
                key,
                deduplicated: true,
            },
        })
    }

    pub async fn initiate_mutation(
        &self,
        endpoint: &str,
        args: Value,
        options: MutationOptions,
    ) -> Result<MutationRequest> {
        self.coordinator.initiate_mutation(endpoint, args, options).await
    }

    /// Cancel an outstanding request. Returns false if nothing was in flight.
    pub async fn abort(&self, request_id: RequestId) -> bool {
        self.coordinator.abort(request_id).await
    }

    pub async fn prefetch(
        &self,
        endpoint: &str,
        args: Value,
        options: PrefetchOptions,
    ) -> Result<Option<QueryRequest>> {
        self.coordinator.prefetch(endpoint, args, options).await
    }

    pub async fn subscribe(
        &self,
        endpoint: &str,
        args: Value,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.subscriptions
            .subscribe(endpoint, args, subscriber, options)
            .await
    }

    pub async fn unsubscribe(&self, endpoint: &str, args: &Value, subscriber: SubscriberId) -> Result<bool> {
        let key = self.shared.resolve_key(endpoint, args)?;
        Ok(self.subscriptions.unsubscribe(&key, subscriber).await)
    }

    pub async fn update_subscription_options(
        &self,
        endpoint: &str,
        args: &Value,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<bool> {
        let key = self.shared.resolve_key(endpoint, args)?;
        Ok(self.subscriptions.update_options(&key, subscriber, options).await)
    }

    /// Move `subscriber` from `old_args` to `new_args` on the same endpoint
    pub async fn change_args(
        &self,
        endpoint: &str,
        subscriber: SubscriberId,
        old_args: &Value,
        new_args: Value,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.subscriptions
            .change_args(endpoint, subscriber, old_args, new_args, options)
            .await
    }

    /// Drop a tracked mutation entry
    pub async fn unsubscribe_mutation(&self, request_id: RequestId) -> bool {
        let mut store = self.shared.store.write().await;
        let applied = self
            .shared
            .dispatch(&mut store, CacheEvent::MutationRemoved { request_id });
        !applied.notifications.is_empty()
    }

    pub async fn select(&self, endpoint: &str, args: &Value) -> Result<QueryView> {
        let key = self.shared.resolve_key(endpoint, args)?;
        Ok(self.select_key(&key).await)
    }

    pub async fn select_key(&self, key: &CacheKey) -> QueryView {
        let store = self.shared.store.read().await;
        select_query(&store.state, key)
    }

    pub async fn select_mutation(&self, request_id: RequestId) -> MutationView {
        let store = self.shared.store.read().await;
        select_mutation(&store.state, &request_id)
    }

    /// Merge `patch` (RFC 7386) into cached data. Returns false without data.
    pub async fn patch_query_result(&self, endpoint: &str, args: &Value, patch: Value) -> Result<bool> {
        let key = self.shared.resolve_key(endpoint, args)?;
        let mut store = self.shared.store.write().await;
        let applied = self.shared.dispatch(
            &mut store,
            CacheEvent::QueryResultPatched {
                key,
                patch: QueryPatch::Merge(patch),
                at: Utc::now(),
            },
        );
        Ok(!applied.notifications.is_empty())
    }

    /// Rewrite cached data with `recipe` applied to a copy
    pub async fn update_query_result<F>(
        &self,
        endpoint: &str,
        args: &Value,
        recipe: F,
    ) -> Result<Option<PatchCollection>>
    where
        F: FnOnce(&mut Value),
    {
        let key = self.shared.resolve_key(endpoint, args)?;
        let mut store = self.shared.store.write().await;

        let Some(previous) = store.state.query(&key).and_then(|entry| entry.data.clone()) else {
            debug!("No cached data to update for {}", key);
            return Ok(None);
        };
        let mut next = previous.clone();
        recipe(&mut next);

        self.shared.dispatch(
            &mut store,
            CacheEvent::QueryResultPatched {
                key: key.clone(),
                patch: QueryPatch::Replace(next.clone()),
                at: Utc::now(),
            },
        );
        Ok(Some(PatchCollection { key, previous, next }))
    }

    /// Restore the data an update replaced
    pub async fn undo_patch(&self, collection: &PatchCollection) -> bool {
        let mut store = self.shared.store.write().await;
        let applied = self.shared.dispatch(
            &mut store,
            CacheEvent::QueryResultPatched {
                key: collection.key.clone(),
                patch: collection.inverse(),
                at: Utc::now(),
            },
        );
        !applied.notifications.is_empty()
    }

    /// Refetch subscribed entries providing `tags`, mark the rest stale
    pub async fn invalidate_tags(&self, tags: Vec<Tag>) -> BTreeSet<CacheKey> {
        let mut store = self.shared.store.write().await;
        self.coordinator
            .invalidate(&mut store, tags, InvalidationReason::Manual)
    }

    /// Drop every entry providing `tags`
    pub async fn remove_by_tags(&self, tags: Vec<Tag>) -> BTreeSet<CacheKey> {
        let mut store = self.shared.store.write().await;
        let affected = store.state.affected_keys(&tags);
        for key in &affected {
            self.shared.remove_query(&mut store, key);
        }
        info!(
            "[{}] Removed {} entries ({})",
            self.shared.config.reducer_path,
            affected.len(),
            InvalidationReason::Removal
        );
        affected
    }

    /// Clear the whole cache, cancelling requests and timers
    pub async fn reset(&self) {
        let mut store = self.shared.store.write().await;
        for (_, flight) in store.in_flight.drain() {
            flight.token.cancel();
        }
        for (_, token) in store.mutation_tokens.drain() {
            token.cancel();
        }
        store.request_keys.clear();
        store.timers.cancel_all();
        self.shared.dispatch(&mut store, CacheEvent::Reset);
        info!("[{}] Cache reset", self.shared.config.reducer_path);
    }

    pub async fn handle_signal(&self, signal: LifecycleSignal) -> Vec<QueryRequest> {
        self.lifecycle.handle(signal).await
    }

    /// Change feed of the cache
    pub fn notifications(&self) -> broadcast::Receiver<CacheNotification> {
        self.shared.notifier.subscribe()
    }

    /// Wait until `key` is no longer pending
    pub async fn settled(&self, key: &CacheKey) -> QueryView {
        let mut notifications = self.notifications();
        loop {
            let view = self.select_key(key).await;
            if !view.is_fetching {
                return view;
            }
            if let Err(broadcast::error::RecvError::Closed) = notifications.recv().await {
                return self.select_key(key).await;
            }
        }
    }

    /// Wait until the mutation `request_id` is no longer pending
    pub async fn settled_mutation(&self, request_id: RequestId) -> MutationView {
        let mut notifications = self.notifications();
        loop {
            let view = self.select_mutation(request_id).await;
            if !view.is_loading {
                return view;
            }
            if let Err(broadcast::error::RecvError::Closed) = notifications.recv().await {
                return self.select_mutation(request_id).await;
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        self.shared.store.read().await.stats.clone()
    }

    /// Copy of the current state tree
    pub async fn snapshot(&self) -> CacheState {
        self.shared.store.read().await.state.clone()
    }
}
