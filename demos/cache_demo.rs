//! Query Cache Demo Application
//!
//! Walks through deduplication, subscriptions, tag invalidation and eviction
//! against an in-memory "posts" backend.
//!
//! Usage:
//!   cargo run --example cache_demo
//!
//! Environment variables (see `ApiConfig::from_env`):
//!   QUERY_CACHE_KEEP_UNUSED_DATA_FOR - seconds before unused entries are evicted
//!   QUERY_CACHE_REFETCH_ON_FOCUS     - refetch subscribed entries on focus
//!   RUST_LOG                         - log filter (default: info)

use ouroboros_query::cache::transport_fn;
use ouroboros_query::{
    ApiBuilder, ApiConfig, InitiateOptions, LifecycleSignal, MutationDefinition, MutationOptions,
    QueryDefinition, SubscriberId, SubscriptionOptions, Tag, TagDescription, TransportError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn post_id(args: &Value) -> i64 {
    args.get("id").and_then(Value::as_i64).unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("=== Query Cache Demo ===");

    let config = ApiConfig::from_env()?;
    info!("Configuration: {:?}", config);

    let posts: Arc<Mutex<HashMap<i64, String>>> = Arc::new(Mutex::new(HashMap::from([
        (1, "first post".to_string()),
        (2, "second post".to_string()),
    ])));

    let backend = posts.clone();
    let transport = transport_fn(move |request, _signal| {
        let backend = backend.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut posts = backend
                .lock()
                .map_err(|_| TransportError::new("backend poisoned"))?;
            match request.endpoint.as_str() {
                "getPost" => {
                    let id = post_id(&request.args);
                    posts
                        .get(&id)
                        .map(|title| json!({ "id": id, "title": title }))
                        .ok_or_else(|| TransportError::new("post not found").with_status(404))
                }
                "updatePost" => {
                    let id = post_id(&request.args);
                    let title = request.args["title"].as_str().unwrap_or_default().to_string();
                    posts.insert(id, title.clone());
                    Ok(json!({ "id": id, "title": title }))
                }
                other => Err(TransportError::new(format!("no route for {}", other))),
            }
        }
    });

    let api = ApiBuilder::new(config)
        .query(
            QueryDefinition::new("getPost").provides_tags(TagDescription::computed(
                |_result, _error, args| vec![Tag::with_id("Post", post_id(args))],
            )),
        )
        .mutation(
            MutationDefinition::new("updatePost").invalidates_tags(TagDescription::computed(
                |_result, _error, args| vec![Tag::with_id("Post", post_id(args))],
            )),
        )
        .transport(transport)
        .finalize()?;

    info!("\n--- Deduplication ---");
    let first = api
        .initiate("getPost", json!({ "id": 1 }), InitiateOptions::default())
        .await?;
    let second = api
        .initiate("getPost", json!({ "id": 1 }), InitiateOptions::default())
        .await?;
    info!(
        "Same request shared: {} (deduplicated: {})",
        first.request_id == second.request_id,
        second.deduplicated
    );
    let view = api.settled(&first.key).await;
    info!("{} -> {:?}", first.key, view.data);

    info!("\n--- Subscription and invalidation ---");
    let subscriber = SubscriberId::new();
    let subscription = api
        .subscribe("getPost", json!({ "id": 2 }), subscriber, SubscriptionOptions::default())
        .await?;
    api.settled(&subscription.key).await;

    let mutation = api
        .initiate_mutation(
            "updatePost",
            json!({ "id": 2, "title": "edited post" }),
            MutationOptions::default(),
        )
        .await?;
    let result = api.settled_mutation(mutation.request_id).await;
    info!("Mutation finished: {}", result.status);

    // Give the invalidation refetch time to land
    tokio::time::sleep(Duration::from_millis(100)).await;
    let view = api.settled(&subscription.key).await;
    info!("{} after invalidation -> {:?}", subscription.key, view.data);

    info!("\n--- Lifecycle signals ---");
    let refetched = api.handle_signal(LifecycleSignal::FocusRegained).await;
    info!("Focus regained, {} entries refetched", refetched.len());

    info!("\n--- Eviction ---");
    api.unsubscribe("getPost", &json!({ "id": 2 }), subscriber).await?;
    info!(
        "Unsubscribed; entry is evicted after {:?} without subscribers",
        api.config().keep_unused_data_for
    );

    info!("\n--- Statistics ---");
    info!("{}", api.stats().await);

    Ok(())
}
