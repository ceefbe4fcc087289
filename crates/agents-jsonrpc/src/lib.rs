//! # agents-jsonrpc
//!
//! JSON-RPC 2.0 transport layer for the Rust Deep Agents SDK's tool and
//! language-server integrations (MCP, LSP).
//!
//! The crate moves JSON-RPC messages over two substrates and leaves the
//! application protocol to the caller:
//!
//! - **Stdio Transport**: spawn a server as a child process and speak
//!   `Content-Length` framed JSON-RPC over its stdin/stdout
//! - **HTTP Transport**: POST messages and accept JSON, batch, or
//!   Server-Sent-Events replies, with session id tracking
//! - **Request Correlation**: every request gets its own timeout; responses,
//!   remote errors, timeouts, and disconnects all settle the same awaitable
//! - **Observers**: unsolicited messages, transport faults and close events go
//!   to a registered [`TransportObserver`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use agents_jsonrpc::{ChannelObserver, JsonRpcMessage, StdioTransport, Transport};
//!
//! // Spawn a server and connect
//! let transport = StdioTransport::spawn("npx", &["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]).await?;
//!
//! let (observer, mut events) = ChannelObserver::new();
//! transport.set_observer(observer);
//!
//! let result = transport
//!     .send(JsonRpcMessage::request(1u64, "tools/list", None))
//!     .await?;
//!
//! transport.disconnect().await;
//! ```

pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod framing;
pub mod protocol;
pub mod sse;
pub mod transport;

// Re-exports
pub use config::{load_servers, ServerConfig};
pub use correlator::{PendingResponse, RequestCorrelator, RequestIdGenerator};
pub use dispatch::{ChannelObserver, CloseInfo, Dispatcher, TransportEvent, TransportObserver};
pub use framing::{encode_frame, FrameParser, ParserState};
pub use protocol::{
    error::{RpcError, RpcResult},
    messages::{
        JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
        RequestId,
    },
};
pub use sse::{SseEvent, SseParser};
pub use transport::{Transport, TransportState};

#[cfg(feature = "http")]
pub use transport::http::{HttpTransport, HttpTransportBuilder};
#[cfg(feature = "stdio")]
pub use transport::stdio::{StdioConfig, StdioTransport};
