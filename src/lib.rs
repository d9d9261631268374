//! # Ouroboros Query (ouroboros-query)
//!
//! A client-side data-fetching cache for Rust: named endpoints, per-argument
//! cache entries, request deduplication and tag-based invalidation.
//!
//! ## Features
//!
//! - Deduplication of identical in-flight queries
//! - Late results from superseded or aborted requests are discarded
//! - Stale-while-error: failed refetches keep the last good data
//! - Subscriber reference counting with delayed eviction
//! - Polling at the smallest interval any subscriber asked for
//! - Tag invalidation with wildcard-then-exact matching
//! - Refetch on focus / reconnect signals
//!
//! ## Queries and Subscriptions
//!
//! ```no_run
//! use ouroboros_query::{ApiBuilder, ApiConfig, QueryDefinition, SubscriberId, SubscriptionOptions, Tag};
//! use ouroboros_query::cache::transport_fn;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let api = ApiBuilder::new(ApiConfig::default())
//!         .query(
//!             QueryDefinition::new("getPost")
//!                 .provides_tags(vec![Tag::of_type("Post")]),
//!         )
//!         .transport(transport_fn(|request, _signal| async move {
//!             Ok(json!({ "id": request.args, "title": "hello" }))
//!         }))
//!         .finalize()?;
//!
//!     let subscriber = SubscriberId::new();
//!     let subscription = api
//!         .subscribe("getPost", json!(1), subscriber, SubscriptionOptions::default())
//!         .await?;
//!
//!     let view = api.settled(&subscription.key).await;
//!     println!("Post: {:?}", view.data);
//!
//!     api.unsubscribe("getPost", &json!(1), subscriber).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Mutations and Invalidation
//!
//! ```no_run
//! use ouroboros_query::{ApiBuilder, ApiConfig, MutationDefinition, MutationOptions, Tag, TagDescription};
//! use ouroboros_query::cache::transport_fn;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let api = ApiBuilder::new(ApiConfig::default())
//!         .mutation(
//!             MutationDefinition::new("updatePost").invalidates_tags(TagDescription::computed(
//!                 |_result, _error, args| vec![Tag::with_id("Post", args["id"].as_i64().unwrap_or_default())],
//!             )),
//!         )
//!         .transport(transport_fn(|request, _signal| async move { Ok(request.args) }))
//!         .finalize()?;
//!
//!     let mutation = api
//!         .initiate_mutation("updatePost", json!({ "id": 5, "title": "edited" }), MutationOptions::default())
//!         .await?;
//!     let view = api.settled_mutation(mutation.request_id).await;
//!     println!("Mutation status: {}", view.status);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use api::{
    Api, ApiBuilder, ApiHandle, ApiModule, InitiateOptions, LifecycleSignal, MutationOptions,
    MutationRequest, PatchCollection, PrefetchOptions, QueryRequest, Subscription,
};
pub use cache::{
    reduce, ApiConfig, ApiConfigBuilder, CacheEvent, CacheKey, CacheNotification, CacheState,
    CacheStats, EndpointDefinition, KeyResolver, MutationDefinition, MutationView, QueryDefinition,
    QueryStatus, QueryView, RequestId, StalenessPolicy, SubscriberId, SubscriptionOptions, Tag,
    TagDescription, TagId, Transport, TransportError, TransportRequest,
};
pub use error::{QueryCacheError, Result};
