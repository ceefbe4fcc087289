//! Transport Error Types
//!
//! One taxonomy for both substrates. Request-scoped failures (timeout, remote
//! error, closed-while-pending) reject a single awaitable; transport-scoped
//! failures (protocol errors, stderr output, unexpected exit) are reported to
//! the registered observer instead.

use std::time::Duration;

use crate::protocol::messages::{JsonRpcError, RequestId};
use thiserror::Error;

/// JSON-RPC Transport Error
#[derive(Debug, Error)]
pub enum RpcError {
    /// The process could not be spawned, or the connect step timed out
    #[error("Connection error: {0}")]
    Connection(String),

    /// `connect()` was called on a process transport that is not disconnected
    #[error("Transport is already connected")]
    AlreadyConnected,

    /// Bytes that do not form a valid JSON-RPC frame or message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A pending request's timer elapsed before its response arrived
    #[error("Request '{method}' timed out after {}ms", .timeout.as_millis())]
    RequestTimeout { method: String, timeout: Duration },

    /// Send attempted while not connected, or the transport went away while a
    /// request was pending
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// JSON-RPC error object returned by the server
    #[error("Remote error: {0}")]
    Remote(#[from] JsonRpcError),

    /// Non-2xx HTTP status on a send
    #[error("HTTP error {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// A request with this id is already pending
    #[error("Duplicate request id: {0}")]
    DuplicateRequestId(RequestId),

    /// A line the server wrote to its stderr
    #[error("Server stderr: {0}")]
    Stderr(String),

    /// JSON serialization error on the outbound path
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client failure (connection refused, broken stream, ...)
    #[cfg(feature = "http")]
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RpcError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        RpcError::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        RpcError::Protocol(msg.into())
    }

    /// Create a transport-closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        RpcError::TransportClosed(msg.into())
    }

    /// Check if this is a request timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::RequestTimeout { .. })
    }

    /// Check if this is a remote JSON-RPC error
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote(_))
    }

    /// Check if the transport was closed under the request
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, RpcError::TransportClosed(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, RpcError::Protocol(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RpcError::Connection(_) | RpcError::AlreadyConnected)
    }

    /// The remote error object, if the server answered with one
    pub fn remote_error(&self) -> Option<&JsonRpcError> {
        match self {
            RpcError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for transport operations
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_names_method_and_duration() {
        let err = RpcError::RequestTimeout {
            method: "tools/call".to_string(),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Request 'tools/call' timed out after 1500ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_remote_error_keeps_code_and_message() {
        let err = RpcError::from(JsonRpcError::new(-32601, "Method not found"));
        assert!(err.is_remote());
        let remote = err.remote_error().unwrap();
        assert_eq!(remote.code, -32601);
        assert_eq!(remote.message, "Method not found");
    }

    #[test]
    fn test_error_helpers() {
        assert!(RpcError::closed("transport disconnected").is_transport_closed());
        assert!(RpcError::protocol("bad frame").is_protocol());
        assert!(RpcError::AlreadyConnected.is_connection());
        assert!(!RpcError::AlreadyConnected.is_timeout());
    }

    #[test]
    fn test_http_status_display() {
        let err = RpcError::HttpStatus {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP error 503: unavailable");
    }
}
