//! Client-side error types.

use chainevents_core::SourceError;
use thiserror::Error;

use crate::rpc::JsonRpcError;

#[derive(Debug, Error)]
pub enum RpcError {
    /// WebSocket connect/send/receive failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The connection dropped before the request completed, or is currently down.
    #[error("connection closed")]
    Closed,

    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The response was well-formed JSON but not the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WebSocket(_) | Self::Timeout { .. } | Self::Closed)
    }
}

impl From<RpcError> for SourceError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::WebSocket(msg) => SourceError::WebSocket(msg),
            RpcError::Rpc(e) => SourceError::Rpc(e.to_string()),
            RpcError::Timeout { ms } => SourceError::Timeout { ms },
            RpcError::Closed => SourceError::Closed,
            other @ (RpcError::Deserialization(_) | RpcError::InvalidResponse(_)) => {
                SourceError::Other(other.to_string())
            }
        }
    }
}
