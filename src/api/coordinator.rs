//! Request coordinator
//!
//! Starts queries and mutations through the transport. Identical queries
//! share one in-flight request unless a refetch is forced, in which case the
//! older request is cancelled and its result discarded when it lands.

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::store::{CacheStore, InFlight, Shared};
use crate::api::subscriptions::evict_when_unused;
use crate::cache::{
    endpoint::EndpointKind,
    entry::SubscriptionOptions,
    invalidation::{report_unknown_tag_types, InvalidationPlan, InvalidationReason},
    state::CacheEvent,
    tags::Tag,
    transport::{TransportError, TransportRequest, TransportResult},
    types::{CacheKey, RequestId, SubscriberId},
};
use crate::error::Result;

/// Options for [`crate::Api::initiate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitiateOptions {
    /// Start a new request even when one is already in flight
    pub force_refetch: bool,

    /// Also register this subscriber on the key
    pub subscribe: Option<(SubscriberId, SubscriptionOptions)>,
}

impl InitiateOptions {
    pub fn forced() -> Self {
        Self {
            force_refetch: true,
            subscribe: None,
        }
    }

    pub fn subscribed(subscriber: SubscriberId, options: SubscriptionOptions) -> Self {
        Self {
            force_refetch: false,
            subscribe: Some((subscriber, options)),
        }
    }
}

/// Handle to a started (or joined) query request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub request_id: RequestId,
    pub key: CacheKey,
    /// Joined a request that was already in flight
    pub deduplicated: bool,
}

/// Options for [`crate::Api::initiate_mutation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOptions {
    /// Keep a mutation entry observable through selectors
    pub track: bool,
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self { track: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub request_id: RequestId,
    pub endpoint: String,
    pub tracked: bool,
}

/// Options for [`crate::Api::prefetch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchOptions {
    /// Always fetch
    pub force: bool,

    /// Fetch when the cached data is at least this old
    pub if_older_than: Option<Duration>,
}

#[derive(Clone)]
pub(crate) struct RequestCoordinator {
    shared: Arc<Shared>,
}

impl RequestCoordinator {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Start or join the request for `key`. Must be called with the store locked.
    pub fn start_query(
        &self,
        store: &mut CacheStore,
        key: CacheKey,
        endpoint: &str,
        args: Value,
        force: bool,
    ) -> QueryRequest {
        if !force {
            if let Some(flight) = store.in_flight.get(&key) {
                store.stats.deduplicated += 1;
                debug!("Joining in-flight request {} for {}", flight.request_id, key);
                return QueryRequest {
                    request_id: flight.request_id,
                    key,
                    deduplicated: true,
                };
            }
        }

        if let Some(superseded) = store.cancel_in_flight(&key) {
            debug!("Superseding request {} for {}", superseded, key);
        }

        let request_id = RequestId::new();
        let token = CancellationToken::new();

        self.shared.dispatch(
            store,
            CacheEvent::QueryStarted {
                key: key.clone(),
                endpoint: endpoint.to_string(),
                args: args.clone(),
                request_id,
                at: Utc::now(),
            },
        );
        store.in_flight.insert(
            key.clone(),
            InFlight {
                request_id,
                token: token.clone(),
            },
        );
        store.request_keys.insert(request_id, key.clone());
        store.stats.transport_calls += 1;

        let request = TransportRequest {
            request_id,
            endpoint: endpoint.to_string(),
            kind: EndpointKind::Query,
            args: args.clone(),
        };
        // Issued under the lock so transport calls keep initiation order
        let call = self.shared.transport.execute(request, token.clone());
        let coordinator = self.clone();
        let task_key = key.clone();
        let task_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            coordinator
                .run_query(task_key, task_endpoint, args, request_id, call, token)
                .await;
        });

        QueryRequest {
            request_id,
            key,
            deduplicated: false,
        }
    }

    /// Refetch an existing entry from its stored arguments
    pub fn refetch(&self, store: &mut CacheStore, key: &CacheKey, force: bool) -> Option<QueryRequest> {
        let entry = store.state.query(key)?;
        let endpoint = entry.endpoint_name.clone();
        let args = entry.original_args.clone();
        store.stats.refetches += 1;
        Some(self.start_query(store, key.clone(), &endpoint, args, force))
    }

    pub async fn initiate(&self, endpoint: &str, args: Value, force: bool) -> Result<QueryRequest> {
        self.shared.endpoints.query(endpoint)?;
        let key = self.shared.resolve_key(endpoint, &args)?;

        let mut store = self.shared.store.write().await;
        Ok(self.start_query(&mut store, key, endpoint, args, force))
    }

    pub async fn prefetch(
        &self,
        endpoint: &str,
        args: Value,
        options: PrefetchOptions,
    ) -> Result<Option<QueryRequest>> {
        self.shared.endpoints.query(endpoint)?;
        let key = self.shared.resolve_key(endpoint, &args)?;

        let mut store = self.shared.store.write().await;
        let needs_fetch = options.force
            || match store.state.query(&key).and_then(|entry| entry.age(Utc::now())) {
                None => true,
                Some(age) => options.if_older_than.is_some_and(|max_age| age >= max_age),
            };

        if !needs_fetch {
            debug!("Prefetch skipped, cached data is fresh: {}", key);
            return Ok(None);
        }
        Ok(Some(self.start_query(&mut store, key, endpoint, args, options.force)))
    }

    async fn run_query(
        self,
        key: CacheKey,
        endpoint: String,
        args: Value,
        request_id: RequestId,
        call: BoxFuture<'static, TransportResult>,
        token: CancellationToken,
    ) {
        let Some(result) = race(call, token).await else {
            debug!("Request {} for {} was cancelled", request_id, key);
            return;
        };

        let mut store = self.shared.store.write().await;
        if !store.is_in_flight(&key, request_id) {
            store.stats.dropped_results += 1;
            debug!("Discarding result of request {} for {}", request_id, key);
            return;
        }
        store.in_flight.remove(&key);
        store.request_keys.remove(&request_id);

        let event = match result {
            Ok(data) => {
                let provided_tags = match self.shared.endpoints.query(&endpoint) {
                    Ok(definition) => definition.provides_tags.resolve(Some(&data), None, &args),
                    Err(_) => Vec::new(),
                };
                report_unknown_tag_types(&self.shared.config, &endpoint, &provided_tags);
                CacheEvent::QuerySucceeded {
                    key: key.clone(),
                    request_id,
                    data,
                    provided_tags,
                    at: Utc::now(),
                }
            }
            Err(error) => {
                debug!("Request {} for {} failed: {}", request_id, key, error);
                CacheEvent::QueryFailed {
                    key: key.clone(),
                    request_id,
                    error,
                }
            }
        };
        self.shared.dispatch(&mut store, event);
        evict_when_unused(&self.shared, &mut store, &key);
    }

    pub async fn initiate_mutation(
        &self,
        endpoint: &str,
        args: Value,
        options: MutationOptions,
    ) -> Result<MutationRequest> {
        self.shared.endpoints.mutation(endpoint)?;

        let request_id = RequestId::new();
        let token = CancellationToken::new();

        let mut store = self.shared.store.write().await;
        if options.track {
            self.shared.dispatch(
                &mut store,
                CacheEvent::MutationStarted {
                    request_id,
                    endpoint: endpoint.to_string(),
                    args: args.clone(),
                    at: Utc::now(),
                },
            );
        }
        store.mutation_tokens.insert(request_id, token.clone());
        store.stats.transport_calls += 1;

        let request = TransportRequest {
            request_id,
            endpoint: endpoint.to_string(),
            kind: EndpointKind::Mutation,
            args: args.clone(),
        };
        let call = self.shared.transport.execute(request, token.clone());
        drop(store);

        let coordinator = self.clone();
        let task_endpoint = endpoint.to_string();
        tokio::spawn(async move {
            coordinator
                .run_mutation(task_endpoint, args, request_id, call, token, options.track)
                .await;
        });

        Ok(MutationRequest {
            request_id,
            endpoint: endpoint.to_string(),
            tracked: options.track,
        })
    }

    async fn run_mutation(
        self,
        endpoint: String,
        args: Value,
        request_id: RequestId,
        call: BoxFuture<'static, TransportResult>,
        token: CancellationToken,
        track: bool,
    ) {
        let Some(result) = race(call, token).await else {
            debug!("Mutation {} was cancelled", request_id);
            return;
        };

        let mut store = self.shared.store.write().await;
        if store.mutation_tokens.remove(&request_id).is_none() {
            store.stats.dropped_results += 1;
            debug!("Discarding result of aborted mutation {}", request_id);
            return;
        }

        match result {
            Ok(data) => {
                let tags = match self.shared.endpoints.mutation(&endpoint) {
                    Ok(definition) => definition.invalidates_tags.resolve(Some(&data), None, &args),
                    Err(_) => Vec::new(),
                };
                if track {
                    self.shared.dispatch(
                        &mut store,
                        CacheEvent::MutationSucceeded {
                            request_id,
                            data,
                            at: Utc::now(),
                        },
                    );
                }
                if !tags.is_empty() {
                    report_unknown_tag_types(&self.shared.config, &endpoint, &tags);
                    self.invalidate(&mut store, tags, InvalidationReason::Mutation { endpoint });
                }
            }
            Err(error) => {
                debug!("Mutation {} failed: {}", request_id, error);
                if track {
                    self.shared
                        .dispatch(&mut store, CacheEvent::MutationFailed { request_id, error });
                }
            }
        }
    }

    /// Mark and refetch everything providing `tags`. Must be called with the store locked.
    pub fn invalidate(
        &self,
        store: &mut CacheStore,
        tags: Vec<Tag>,
        reason: InvalidationReason,
    ) -> BTreeSet<CacheKey> {
        let plan = InvalidationPlan::compute(&store.state, &tags);
        if plan.is_empty() {
            debug!("Invalidation matched no entries ({})", reason);
            return BTreeSet::new();
        }
        store.stats.invalidations += plan.affected.len() as u64;

        info!(
            "[{}] Invalidated {} entries ({}), refetching {}",
            self.shared.config.reducer_path,
            plan.affected.len(),
            reason,
            plan.refetch.len()
        );

        self.shared.dispatch(store, plan.mark_event());
        for key in &plan.refetch {
            self.refetch(store, key, true);
        }
        plan.affected
    }

    /// Abort an outstanding query or mutation
    pub async fn abort(&self, request_id: RequestId) -> bool {
        let mut store = self.shared.store.write().await;

        if let Some(key) = store.request_keys.get(&request_id).cloned() {
            if store.is_in_flight(&key, request_id) {
                store.cancel_in_flight(&key);
                store.stats.aborted += 1;
                self.shared.dispatch(
                    &mut store,
                    CacheEvent::QueryFailed {
                        key: key.clone(),
                        request_id,
                        error: TransportError::aborted(),
                    },
                );
                evict_when_unused(&self.shared, &mut store, &key);
                info!("Aborted request {} for {}", request_id, key);
                return true;
            }
        }

        if let Some(token) = store.mutation_tokens.remove(&request_id) {
            token.cancel();
            store.stats.aborted += 1;
            if store.state.mutation(&request_id).is_some() {
                self.shared.dispatch(
                    &mut store,
                    CacheEvent::MutationFailed {
                        request_id,
                        error: TransportError::aborted(),
                    },
                );
            }
            info!("Aborted mutation {}", request_id);
            return true;
        }

        warn!("Abort requested for unknown or settled request {}", request_id);
        false
    }
}

/// Await the transport unless the token is cancelled first
async fn race(call: BoxFuture<'static, TransportResult>, token: CancellationToken) -> Option<TransportResult> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = call => Some(result),
    }
}
