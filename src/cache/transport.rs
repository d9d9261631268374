//! The transport seam
//!
//! The cache never performs I/O itself. Every query and mutation is handed to
//! a [`Transport`], which resolves to either data or a [`TransportError`].
//! The cancellation token is cancelled when the request is aborted or
//! superseded; honoring it is up to the transport.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::cache::endpoint::EndpointKind;
use crate::cache::types::RequestId;

/// Result of one transport execution
pub type TransportResult = std::result::Result<Value, TransportError>;

/// What kind of failure a request ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Reported by the transport
    #[default]
    Transport,
    /// The consumer aborted the request
    Aborted,
}

/// Failure payload stored verbatim on the cache entry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Transport,
            message: message.into(),
            status: None,
            data: None,
        }
    }

    /// Error recorded when a consumer aborts a request
    pub fn aborted() -> Self {
        Self {
            kind: TransportErrorKind::Aborted,
            message: "request aborted".to_string(),
            status: None,
            data: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == TransportErrorKind::Aborted
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

/// Everything the transport needs to execute one request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub request_id: RequestId,
    pub endpoint: String,
    pub kind: EndpointKind,
    pub args: Value,
}

/// Performs the actual network (or other) I/O for an endpoint
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        request: TransportRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, TransportResult>;
}

/// Adapter turning an async closure into a [`Transport`]
pub struct FnTransport<F>(F);

/// Build a transport from a closure returning a future
pub fn transport_fn<F, Fut>(f: F) -> FnTransport<F>
where
    F: Fn(TransportRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult> + Send + 'static,
{
    FnTransport(f)
}

impl<F, Fut> Transport for FnTransport<F>
where
    F: Fn(TransportRequest, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransportResult> + Send + 'static,
{
    fn execute(
        &self,
        request: TransportRequest,
        signal: CancellationToken,
    ) -> BoxFuture<'static, TransportResult> {
        Box::pin((self.0)(request, signal))
    }
}
