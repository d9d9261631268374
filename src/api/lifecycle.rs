//! Focus and connectivity signals

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::coordinator::{QueryRequest, RequestCoordinator};
use crate::api::store::Shared;
use crate::cache::{state::CacheEvent, types::QueryStatus};

/// Edge events emitted by the host environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    FocusRegained,
    FocusLost,
    ConnectivityRestored,
    ConnectivityLost,
}

impl fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleSignal::FocusRegained => write!(f, "focus regained"),
            LifecycleSignal::FocusLost => write!(f, "focus lost"),
            LifecycleSignal::ConnectivityRestored => write!(f, "connectivity restored"),
            LifecycleSignal::ConnectivityLost => write!(f, "connectivity lost"),
        }
    }
}

impl LifecycleSignal {
    fn event(self) -> CacheEvent {
        match self {
            LifecycleSignal::FocusRegained => CacheEvent::FocusChanged { focused: true },
            LifecycleSignal::FocusLost => CacheEvent::FocusChanged { focused: false },
            LifecycleSignal::ConnectivityRestored => CacheEvent::OnlineChanged { online: true },
            LifecycleSignal::ConnectivityLost => CacheEvent::OnlineChanged { online: false },
        }
    }
}

#[derive(Clone)]
pub(crate) struct LifecycleRouter {
    shared: Arc<Shared>,
    coordinator: RequestCoordinator,
}

impl LifecycleRouter {
    pub fn new(shared: Arc<Shared>, coordinator: RequestCoordinator) -> Self {
        Self { shared, coordinator }
    }

    fn refetches_on(&self, signal: LifecycleSignal) -> bool {
        match signal {
            LifecycleSignal::FocusRegained => self.shared.config.refetch_on_focus,
            LifecycleSignal::ConnectivityRestored => self.shared.config.refetch_on_reconnect,
            LifecycleSignal::FocusLost | LifecycleSignal::ConnectivityLost => false,
        }
    }

    /// Record the signal and refetch subscribed entries when enabled for it
    pub async fn handle(&self, signal: LifecycleSignal) -> Vec<QueryRequest> {
        let mut store = self.shared.store.write().await;
        self.shared.dispatch(&mut store, signal.event());

        if !self.refetches_on(signal) {
            debug!("Signal '{}' recorded, refetch disabled", signal);
            return Vec::new();
        }

        let eligible: Vec<_> = store
            .state
            .subscribed_keys()
            .into_iter()
            .filter(|key| {
                store.state.query(key).is_some_and(|entry| {
                    !matches!(entry.status, QueryStatus::Pending | QueryStatus::Uninitialized)
                })
            })
            .collect();

        let requests: Vec<QueryRequest> = eligible
            .iter()
            .filter_map(|key| self.coordinator.refetch(&mut store, key, false))
            .collect();

        info!(
            "[{}] {}: refetching {} subscribed entries",
            self.shared.config.reducer_path,
            signal,
            requests.len()
        );
        requests
    }
}
