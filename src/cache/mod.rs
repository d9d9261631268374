//! # Query Cache Core
//!
//! Data model and pure state transitions of the query cache. Nothing in this
//! module spawns tasks or performs I/O; the runtime lives in [`crate::api`].
//!
//! ## Features
//!
//! - **Deterministic Keys**: canonical-JSON key resolution, pluggable per API
//! - **Request Id Guard**: late results from superseded requests are dropped
//! - **Stale-While-Error**: failed refetches keep the last good data visible
//! - **Tag Index**: wildcard-then-exact matching from tags to cache keys
//! - **Reducer**: every change is a [`CacheEvent`] applied to [`CacheState`]
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query::cache::{reduce, select_query, CacheEvent, CacheKey, CacheState, RequestId};
//! use serde_json::json;
//!
//! let key = CacheKey::from("getPost(1)");
//! let request_id = RequestId::new();
//!
//! let state = reduce(CacheState::new(), &CacheEvent::QueryStarted {
//!     key: key.clone(),
//!     endpoint: "getPost".to_string(),
//!     args: json!(1),
//!     request_id,
//!     at: chrono::Utc::now(),
//! });
//! let state = reduce(state, &CacheEvent::QuerySucceeded {
//!     key: key.clone(),
//!     request_id,
//!     data: json!({"title": "hello"}),
//!     provided_tags: vec![],
//!     at: chrono::Utc::now(),
//! });
//!
//! assert!(select_query(&state, &key).is_success);
//! ```

pub mod config;
pub mod endpoint;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod selectors;
pub mod state;
pub mod tags;
pub mod transport;
pub mod types;

pub use config::{ApiConfig, ApiConfigBuilder, StalenessPolicy};
pub use endpoint::{EndpointDefinition, EndpointKind, Endpoints, MutationDefinition, QueryDefinition};
pub use entry::{MutationCacheEntry, QueryCacheEntry, SubscriptionOptions};
pub use invalidation::{InvalidationPlan, InvalidationReason};
pub use key::{DefaultKeyResolver, KeyResolver};
pub use selectors::{select_mutation, select_query, MutationView, QueryView};
pub use state::{reduce, Applied, CacheEvent, CacheNotification, CacheState, QueryPatch, StateFlags};
pub use tags::{Tag, TagDescription, TagId, TagIndex};
pub use transport::{transport_fn, Transport, TransportError, TransportErrorKind, TransportRequest, TransportResult};
pub use types::{CacheKey, CacheStats, QueryStatus, RequestId, SubscriberId};
