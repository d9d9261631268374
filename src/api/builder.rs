//! Two-phase API construction
//!
//! [`ApiBuilder`] collects configuration, endpoints, the key resolver and the
//! transport. Components that need the API before it exists can take an
//! [`ApiHandle`] from the builder; the handle starts working once
//! [`ApiBuilder::finalize`] has run and fails with
//! [`QueryCacheError::NotFinalized`] until then.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::info;

use crate::api::coordinator::{InitiateOptions, MutationOptions, MutationRequest, QueryRequest};
use crate::api::lifecycle::LifecycleSignal;
use crate::api::subscriptions::Subscription;
use crate::api::Api;
use crate::cache::{
    config::ApiConfig,
    endpoint::{EndpointDefinition, Endpoints, MutationDefinition, QueryDefinition},
    entry::SubscriptionOptions,
    key::{DefaultKeyResolver, KeyResolver},
    selectors::QueryView,
    tags::Tag,
    transport::Transport,
    types::{CacheKey, SubscriberId},
};
use crate::error::{QueryCacheError, Result};

/// Modules an API can be composed of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiModule {
    /// Cache, coordinator, subscriptions, invalidation and lifecycle routing
    Core,
}

impl fmt::Display for ApiModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiModule::Core => write!(f, "core"),
        }
    }
}

/// Configuration phase of an [`Api`]
pub struct ApiBuilder {
    config: ApiConfig,
    definitions: Vec<EndpointDefinition>,
    resolver: Arc<dyn KeyResolver>,
    transport: Option<Arc<dyn Transport>>,
    slot: Arc<OnceLock<Api>>,
}

impl Default for ApiBuilder {
    fn default() -> Self {
        Self::new(ApiConfig::default())
    }
}

impl ApiBuilder {
    pub fn new(config: ApiConfig) -> Self {
        Self {
            config,
            definitions: Vec::new(),
            resolver: Arc::new(DefaultKeyResolver),
            transport: None,
            slot: Arc::new(OnceLock::new()),
        }
    }

    pub fn query(mut self, definition: QueryDefinition) -> Self {
        self.definitions.push(definition.into());
        self
    }

    pub fn mutation(mut self, definition: MutationDefinition) -> Self {
        self.definitions.push(definition.into());
        self
    }

    pub fn endpoint(mut self, definition: impl Into<EndpointDefinition>) -> Self {
        self.definitions.push(definition.into());
        self
    }

    /// Replace the default canonical-JSON key resolver
    pub fn key_resolver(mut self, resolver: impl KeyResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// A handle that resolves to the API once it is finalized
    pub fn handle(&self) -> ApiHandle {
        ApiHandle {
            slot: self.slot.clone(),
        }
    }

    /// Validate everything, compose the components and arm every handle
    pub fn finalize(&self) -> Result<Api> {
        if self.slot.get().is_some() {
            return Err(QueryCacheError::AlreadyFinalized);
        }

        self.config.validate()?;
        let transport = self.transport.clone().ok_or(QueryCacheError::MissingTransport)?;

        let mut endpoints = Endpoints::default();
        for definition in &self.definitions {
            endpoints.insert(definition.clone())?;
        }

        info!(
            "[{}] Finalizing API with {} endpoints",
            self.config.reducer_path,
            endpoints.len()
        );

        let api = Api::compose(
            self.config.clone(),
            endpoints,
            self.resolver.clone(),
            transport,
            vec![ApiModule::Core],
        );

        self.slot
            .set(api.clone())
            .map_err(|_| QueryCacheError::AlreadyFinalized)?;
        Ok(api)
    }
}

/// Late-bound reference to an [`Api`]
#[derive(Clone)]
pub struct ApiHandle {
    slot: Arc<OnceLock<Api>>,
}

impl fmt::Debug for ApiHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiHandle")
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl ApiHandle {
    pub fn is_finalized(&self) -> bool {
        self.slot.get().is_some()
    }

    fn api(&self, operation: &'static str) -> Result<&Api> {
        self.slot
            .get()
            .ok_or(QueryCacheError::NotFinalized { operation })
    }

    /// The finalized API
    pub fn get(&self) -> Result<Api> {
        self.api("get").cloned()
    }

    pub fn resolve_key(&self, endpoint: &str, args: &Value) -> Result<CacheKey> {
        self.api("resolve_key")?.resolve_key(endpoint, args)
    }

    pub async fn initiate(&self, endpoint: &str, args: Value, options: InitiateOptions) -> Result<QueryRequest> {
        self.api("initiate")?.initiate(endpoint, args, options).await
    }

    pub async fn initiate_mutation(
        &self,
        endpoint: &str,
        args: Value,
        options: MutationOptions,
    ) -> Result<MutationRequest> {
        self.api("initiate_mutation")?
            .initiate_mutation(endpoint, args, options)
            .await
    }

    pub async fn subscribe(
        &self,
        endpoint: &str,
        args: Value,
        subscriber: SubscriberId,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        self.api("subscribe")?
            .subscribe(endpoint, args, subscriber, options)
            .await
    }

    pub async fn unsubscribe(&self, endpoint: &str, args: &Value, subscriber: SubscriberId) -> Result<bool> {
        self.api("unsubscribe")?.unsubscribe(endpoint, args, subscriber).await
    }

    pub async fn select(&self, endpoint: &str, args: &Value) -> Result<QueryView> {
        self.api("select")?.select(endpoint, args).await
    }

    pub async fn invalidate_tags(&self, tags: Vec<Tag>) -> Result<BTreeSet<CacheKey>> {
        Ok(self.api("invalidate_tags")?.invalidate_tags(tags).await)
    }

    pub async fn handle_signal(&self, signal: LifecycleSignal) -> Result<Vec<QueryRequest>> {
        Ok(self.api("handle_signal")?.handle_signal(signal).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::transport::transport_fn;
    use serde_json::json;

    fn echo_builder() -> ApiBuilder {
        ApiBuilder::default()
            .query(QueryDefinition::new("getPost"))
            .transport(transport_fn(|request, _signal| async move { Ok(request.args) }))
    }

    #[tokio::test]
    async fn test_handle_before_finalize() {
        let builder = echo_builder();
        let handle = builder.handle();
        assert!(!handle.is_finalized());

        let err = handle
            .initiate("getPost", json!(1), InitiateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryCacheError::NotFinalized { operation: "initiate" }));
        assert!(matches!(
            handle.select("getPost", &json!(1)).await,
            Err(QueryCacheError::NotFinalized { operation: "select" })
        ));
        assert!(matches!(
            handle.invalidate_tags(vec![]).await,
            Err(QueryCacheError::NotFinalized { .. })
        ));
        assert!(handle.get().is_err());

        builder.finalize().unwrap();
        assert!(handle.is_finalized());
        let view = handle.select("getPost", &json!(1)).await.unwrap();
        assert!(view.is_uninitialized);
    }

    #[tokio::test]
    async fn test_finalize_twice() {
        let builder = echo_builder();
        builder.finalize().unwrap();
        assert!(matches!(
            builder.finalize(),
            Err(QueryCacheError::AlreadyFinalized)
        ));
    }

    #[test]
    fn test_finalize_errors() {
        let missing = ApiBuilder::default().query(QueryDefinition::new("getPost"));
        assert!(matches!(missing.finalize(), Err(QueryCacheError::MissingTransport)));

        let duplicate = echo_builder().query(QueryDefinition::new("getPost"));
        assert!(matches!(
            duplicate.finalize(),
            Err(QueryCacheError::DuplicateEndpoint(_))
        ));

        let invalid = ApiBuilder::new(ApiConfig::builder().notification_capacity(0).build())
            .transport(transport_fn(|request, _signal| async move { Ok(request.args) }));
        assert!(matches!(invalid.finalize(), Err(QueryCacheError::ConfigError(_))));
    }

    #[test]
    fn test_modules() {
        let api = echo_builder().finalize().unwrap();
        assert_eq!(api.modules(), &[ApiModule::Core]);
        assert!(api.has_module(ApiModule::Core));
        assert_eq!(ApiModule::Core.to_string(), "core");
    }
}
