//! Server definitions loadable from JSON
//!
//! Accepts the conventional `{"mcpServers": {...}}` document used by MCP hosts,
//! where each entry is either a process to spawn or an HTTP endpoint:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "filesystem": { "command": "npx", "args": ["-y", "server-filesystem", "/tmp"] },
//!     "remote": { "url": "https://example.com/mcp", "headers": { "Authorization": "Bearer t" } }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::protocol::{RpcError, RpcResult};
use crate::transport::Transport;

#[cfg(feature = "http")]
use crate::transport::http::{HttpTransport, DEFAULT_SESSION_HEADER};
#[cfg(feature = "stdio")]
use crate::transport::stdio::{StdioConfig, StdioTransport};

/// One server entry
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ServerConfig {
    #[cfg(feature = "stdio")]
    Stdio(StdioConfig),
    #[cfg(feature = "http")]
    Http(HttpServerConfig),
}

/// HTTP endpoint definition
#[cfg(feature = "http")]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpServerConfig {
    pub url: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub push_channel: bool,

    #[serde(default = "default_session_header")]
    pub session_header: String,
}

#[cfg(feature = "http")]
fn default_timeout_ms() -> u64 {
    30_000
}

#[cfg(feature = "http")]
fn default_session_header() -> String {
    DEFAULT_SESSION_HEADER.to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServersDocument {
    mcp_servers: BTreeMap<String, ServerConfig>,
}

/// Parse a `{"mcpServers": {...}}` document, keyed by server name.
pub fn load_servers(json: &str) -> RpcResult<BTreeMap<String, ServerConfig>> {
    let document: ServersDocument = serde_json::from_str(json)?;
    Ok(document.mcp_servers)
}

impl ServerConfig {
    /// Build an unconnected transport for this entry.
    pub fn into_transport(self) -> RpcResult<Box<dyn Transport>> {
        match self {
            #[cfg(feature = "stdio")]
            ServerConfig::Stdio(config) => {
                if config.command.trim().is_empty() {
                    return Err(RpcError::connection("server command is empty"));
                }
                Ok(Box::new(StdioTransport::new(config)))
            }
            #[cfg(feature = "http")]
            ServerConfig::Http(config) => {
                // Sub-second precision is not representable in the builder.
                let timeout_secs = config.request_timeout_ms.div_ceil(1000).max(1);
                let transport = HttpTransport::new(config.url)
                    .with_headers(config.headers)
                    .with_timeout_secs(timeout_secs)
                    .with_session_header(config.session_header)
                    .with_push_channel(config.push_channel)
                    .build()?;
                Ok(Box::new(transport))
            }
        }
    }
}
