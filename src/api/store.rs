//! Shared runtime store: the state tree plus everything that must change with it

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{
    config::ApiConfig,
    endpoint::Endpoints,
    key::KeyResolver,
    state::{Applied, CacheEvent, CacheNotification, CacheState},
    transport::Transport,
    types::{CacheKey, CacheStats, RequestId},
};
use crate::error::Result;

/// One outstanding transport call for a query key
pub(crate) struct InFlight {
    pub request_id: RequestId,
    pub token: CancellationToken,
}

pub(crate) struct EvictionTimer {
    pub generation: u64,
    pub handle: JoinHandle<()>,
}

pub(crate) struct PollTimer {
    pub interval: std::time::Duration,
    pub handle: JoinHandle<()>,
}

/// Per-key timer tasks
#[derive(Default)]
pub(crate) struct TimerRegistry {
    pub eviction: HashMap<CacheKey, EvictionTimer>,
    pub polling: HashMap<CacheKey, PollTimer>,
    next_generation: u64,
}

impl TimerRegistry {
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Abort the pending eviction of `key`, if any
    pub fn cancel_eviction(&mut self, key: &CacheKey) -> bool {
        match self.eviction.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_polling(&mut self, key: &CacheKey) {
        if let Some(timer) = self.polling.remove(key) {
            timer.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.eviction.drain() {
            timer.handle.abort();
        }
        for (_, timer) in self.polling.drain() {
            timer.handle.abort();
        }
    }
}

/// Everything guarded by the single lock
#[derive(Default)]
pub(crate) struct CacheStore {
    pub state: CacheState,

    /// Query key -> outstanding request
    pub in_flight: HashMap<CacheKey, InFlight>,

    /// Request id -> query key, for aborts
    pub request_keys: HashMap<RequestId, CacheKey>,

    /// Outstanding mutations
    pub mutation_tokens: HashMap<RequestId, CancellationToken>,

    pub timers: TimerRegistry,

    pub stats: CacheStats,
}

impl CacheStore {
    /// Forget the outstanding request of `key` and cancel its token
    pub fn cancel_in_flight(&mut self, key: &CacheKey) -> Option<RequestId> {
        let flight = self.in_flight.remove(key)?;
        flight.token.cancel();
        self.request_keys.remove(&flight.request_id);
        Some(flight.request_id)
    }

    /// Whether `request_id` is still the outstanding request of `key`
    pub fn is_in_flight(&self, key: &CacheKey, request_id: RequestId) -> bool {
        self.in_flight
            .get(key)
            .is_some_and(|flight| flight.request_id == request_id)
    }
}

/// Immutable configuration plus the locked store, shared by every component
pub(crate) struct Shared {
    pub config: ApiConfig,
    pub endpoints: Endpoints,
    pub resolver: Arc<dyn KeyResolver>,
    pub transport: Arc<dyn Transport>,
    pub store: RwLock<CacheStore>,
    pub notifier: broadcast::Sender<CacheNotification>,
}

impl Shared {
    pub fn new(
        config: ApiConfig,
        endpoints: Endpoints,
        resolver: Arc<dyn KeyResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (notifier, _) = broadcast::channel(config.notification_capacity);
        Self {
            config,
            endpoints,
            resolver,
            transport,
            store: RwLock::new(CacheStore::default()),
            notifier,
        }
    }

    pub fn resolve_key(&self, endpoint: &str, args: &serde_json::Value) -> Result<CacheKey> {
        self.resolver.resolve(endpoint, args)
    }

    /// Apply an event and publish its notifications
    pub fn dispatch(&self, store: &mut CacheStore, event: CacheEvent) -> Applied {
        let applied = store.state.apply(&event);
        if applied.dropped {
            store.stats.dropped_results += 1;
        }
        for notification in &applied.notifications {
            // No receivers is fine
            let _ = self.notifier.send(notification.clone());
        }
        applied
    }

    /// Drop a query entry together with its request and timers
    pub fn remove_query(&self, store: &mut CacheStore, key: &CacheKey) -> bool {
        store.cancel_in_flight(key);
        store.timers.cancel_eviction(key);
        store.timers.cancel_polling(key);
        let applied = self.dispatch(store, CacheEvent::QueryRemoved { key: key.clone() });
        if !applied.notifications.is_empty() {
            debug!("[{}] Removed cache entry: {}", self.config.reducer_path, key);
            true
        } else {
            false
        }
    }
}
