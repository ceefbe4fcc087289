//! Transport Layer
//!
//! This module defines the transport abstraction shared by the stdio and HTTP
//! substrates. A caller connects, sends requests (awaiting the correlated
//! response) or notifications, receives unsolicited traffic through a
//! [`TransportObserver`], and disconnects.

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "stdio")]
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::TransportObserver;
use crate::protocol::{JsonRpcMessage, RpcResult};

/// Lifecycle of a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Transport trait for JSON-RPC communication
///
/// Implementations own their framing, their pending-request table and their
/// I/O tasks. Both implementations are usable as `Box<dyn Transport>`.
///
/// `connect()` semantics differ by substrate: the stdio transport rejects a
/// second `connect()` with [`RpcError::AlreadyConnected`], the HTTP transport
/// treats it as a no-op.
///
/// [`RpcError::AlreadyConnected`]: crate::RpcError::AlreadyConnected
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection
    async fn connect(&self) -> RpcResult<()>;

    /// Send a message using the transport's default request timeout.
    ///
    /// Requests resolve to `Some(result)` once the correlated response arrives.
    /// Notifications and responses resolve to `None` once written.
    async fn send(&self, message: JsonRpcMessage) -> RpcResult<Option<Value>> {
        let timeout = self.request_timeout();
        self.send_with_timeout(message, timeout).await
    }

    /// Send a message, overriding the request timeout for this call only
    async fn send_with_timeout(
        &self,
        message: JsonRpcMessage,
        timeout: Duration,
    ) -> RpcResult<Option<Value>>;

    /// Tear the connection down. Never fails; a no-op when already disconnected.
    async fn disconnect(&self);

    /// Current lifecycle state
    fn state(&self) -> TransportState;

    /// Register the receiver of unsolicited messages, errors and close events
    fn set_observer(&self, observer: Arc<dyn TransportObserver>);

    /// Timeout applied by [`Transport::send`]
    fn request_timeout(&self) -> Duration;

    /// Check if the transport is connected
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}
