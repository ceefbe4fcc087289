//! HTTP Transport
//!
//! Speaks JSON-RPC over HTTP POST to servers that answer with a plain JSON
//! body (one object or a batch array), with `202 Accepted`, or with a
//! `text/event-stream` that carries one JSON-RPC payload per event. The first
//! response carrying a session header pins the session id, which is echoed on
//! every later request until `disconnect()`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use agents_jsonrpc::{HttpTransport, JsonRpcMessage, Transport};
//!
//! let transport = HttpTransport::new("https://your-mcp-server.com/mcp")
//!     .with_header("Authorization", "Bearer token")
//!     .build()?;
//! transport.connect().await?;
//!
//! let result = transport
//!     .send(JsonRpcMessage::request(1u64, "tools/list", None))
//!     .await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{pin_mut, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::dispatch::{Dispatcher, TransportObserver};
use crate::protocol::{parse_payload, JsonRpcMessage, RequestId, RpcError, RpcResult};
use crate::sse::{SseEvent, SseParser};
use crate::transport::{Transport, TransportState};

/// Session header used by the MCP streamable HTTP transport
pub const DEFAULT_SESSION_HEADER: &str = "Mcp-Session-Id";

const EVENT_STREAM: &str = "text/event-stream";

/// State shared between the transport and its in-flight exchanges.
struct Shared {
    url: String,
    client: reqwest::Client,
    headers: HashMap<String, String>,
    session_header: String,
    session_id: RwLock<Option<String>>,
    dispatcher: Dispatcher,
    exchanges: AtomicUsize,
}

impl Shared {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn decorate(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(&self.session_header, session_id);
        }
        request
    }

    /// Pin the session id from the first response that carries one.
    fn capture_session(&self, response: &Response) {
        let Some(value) = response
            .headers()
            .get(&self.session_header)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut session_id = self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if session_id.is_none() {
            debug!(url = %self.url, session_id = %value, "captured session id");
            *session_id = Some(value.to_string());
        }
    }

    fn clear_session(&self) {
        *self
            .session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// POST `body` and dispatch whatever the server answers with.
    async fn post(&self, body: Vec<u8>, timeout: Option<Duration>) -> RpcResult<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream");
        request = self.decorate(request);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.body(body).send().await?;
        self.capture_session(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %self.url, status = status.as_u16(), "HTTP error response");
            return Err(RpcError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        if status == StatusCode::ACCEPTED {
            trace!(url = %self.url, "server accepted message");
            return Ok(());
        }

        if is_event_stream(&response) {
            let messages = sse_messages(response);
            pin_mut!(messages);
            while let Some(parsed) = messages.next().await {
                match parsed {
                    Err(RpcError::Http(e)) => return Err(RpcError::Http(e)),
                    parsed => self.dispatcher.deliver_parsed(parsed),
                }
            }
            return Ok(());
        }

        let bytes = response.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            trace!(url = %self.url, "empty response body");
            return Ok(());
        }
        trace!(url = %self.url, body = %String::from_utf8_lossy(&bytes), "HTTP response");
        for parsed in parse_payload(&bytes) {
            self.dispatcher.deliver_parsed(parsed);
        }
        Ok(())
    }

    /// Long-lived GET for server-initiated messages. Any refusal ends quietly.
    async fn listen(self: Arc<Self>, cancel: CancellationToken) {
        let request = self
            .decorate(self.client.get(&self.url))
            .header(ACCEPT, EVENT_STREAM);

        let response = tokio::select! {
            () = cancel.cancelled() => return,
            response = request.send() => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %self.url, error = %e, "push channel unavailable");
                return;
            }
        };
        self.capture_session(&response);

        let status = response.status();
        if status == StatusCode::NO_CONTENT || !status.is_success() || !is_event_stream(&response) {
            debug!(url = %self.url, status = status.as_u16(), "server declined push channel");
            return;
        }

        debug!(url = %self.url, "push channel open");
        let messages = sse_messages(response);
        pin_mut!(messages);
        loop {
            let parsed = tokio::select! {
                () = cancel.cancelled() => break,
                parsed = messages.next() => parsed,
            };
            match parsed {
                Some(parsed) => self.dispatcher.deliver_parsed(parsed),
                None => break,
            }
        }
        debug!(url = %self.url, "push channel closed");
    }
}

/// Run a POST on its own task until it completes or `token` is cancelled.
fn spawn_exchange<F>(shared: Arc<Shared>, body: Vec<u8>, token: CancellationToken, on_error: F)
where
    F: FnOnce(&Shared, RpcError) + Send + 'static,
{
    shared.exchanges.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(async move {
        let outcome = tokio::select! {
            () = token.cancelled() => {
                trace!(url = %shared.url, "exchange abandoned");
                Ok(())
            }
            outcome = shared.post(body, None) => outcome,
        };
        if let Err(e) = outcome {
            on_error(shared.as_ref(), e);
        }
        shared.exchanges.fetch_sub(1, Ordering::SeqCst);
    });
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().starts_with(EVENT_STREAM))
        .unwrap_or(false)
}

/// Decode an event-stream body into messages as the bytes arrive.
fn sse_messages(response: Response) -> impl Stream<Item = RpcResult<JsonRpcMessage>> + Send {
    async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in parser.push(&chunk) {
                        for parsed in decode_event(&event) {
                            yield parsed;
                        }
                    }
                }
                Err(e) => {
                    yield Err(RpcError::Http(e));
                    break;
                }
            }
        }
        if let Some(event) = parser.finish() {
            for parsed in decode_event(&event) {
                yield parsed;
            }
        }
    }
}

fn decode_event(event: &SseEvent) -> Vec<RpcResult<JsonRpcMessage>> {
    if event.data.trim().is_empty() {
        return Vec::new();
    }
    parse_payload(event.data.as_bytes())
}

/// Stand-in error for batch members when the shared exchange failed.
fn batch_error(error: &RpcError) -> RpcError {
    match error {
        RpcError::HttpStatus { status, body } => RpcError::HttpStatus {
            status: *status,
            body: body.clone(),
        },
        other => RpcError::connection(format!("batch request failed: {}", other)),
    }
}

struct Lifecycle {
    state: TransportState,
    cancel: CancellationToken,
}

/// HTTP Transport for JSON-RPC communication
///
/// ## Features
///
/// - HTTP POST for every outbound message, with configurable headers
/// - JSON, batch and Server-Sent-Events response bodies
/// - Session id capture and propagation
/// - Optional GET push channel for server-initiated messages
pub struct HttpTransport {
    shared: Arc<Shared>,
    request_timeout: Duration,
    push_channel: bool,
    lifecycle: Mutex<Lifecycle>,
}

impl HttpTransport {
    /// Create a new HTTP transport builder
    ///
    /// # Arguments
    ///
    /// * `url` - The server's HTTP endpoint URL
    pub fn new(url: impl Into<String>) -> HttpTransportBuilder {
        HttpTransportBuilder::new(url)
    }

    /// Get the server URL
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Session id captured from the server, if any
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.shared.dispatcher.correlator().len()
    }

    /// POST several messages as one batch array.
    ///
    /// Returns one result per request in the batch, in batch order;
    /// notifications in the batch produce no entry.
    pub async fn send_batch(&self, messages: Vec<JsonRpcMessage>) -> RpcResult<Vec<RpcResult<Value>>> {
        let body = serde_json::to_vec(&messages)?;
        let correlator = self.shared.dispatcher.correlator();

        let mut ids: Vec<RequestId> = Vec::new();
        let mut waiters = Vec::new();
        let exchange = {
            let lifecycle = self.lifecycle();
            ensure_connected(&lifecycle)?;
            for message in &messages {
                if let JsonRpcMessage::Request(request) = message {
                    match correlator.register(request.id.clone(), &request.method, self.request_timeout) {
                        Ok(pending) => {
                            ids.push(request.id.clone());
                            waiters.push(pending);
                        }
                        Err(e) => {
                            for id in &ids {
                                correlator.reject(id, RpcError::closed("batch aborted"));
                            }
                            return Err(e);
                        }
                    }
                }
            }
            lifecycle.cancel.child_token()
        };

        debug!(url = %self.shared.url, size = messages.len(), "MCP HTTP batch send");
        if ids.is_empty() {
            self.shared.post(body, Some(self.request_timeout)).await?;
            return Ok(Vec::new());
        }

        let guard = exchange.clone().drop_guard();
        spawn_exchange(Arc::clone(&self.shared), body, exchange, move |shared, e| {
            for id in &ids {
                shared.dispatcher.correlator().reject(id, batch_error(&e));
            }
        });

        let results = futures::future::join_all(waiters).await;
        if !results.iter().any(is_timeout) {
            guard.disarm();
        }
        Ok(results)
    }

    /// Exchanges (POSTs awaiting or streaming a reply) still running
    pub fn active_exchanges(&self) -> usize {
        self.shared.exchanges.load(Ordering::SeqCst)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> RpcResult<()> {
        // `disconnect` runs start to finish under this lock, so `Closing` is never seen here.
        let cancel = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TransportState::Connected {
                return Ok(());
            }
            lifecycle.state = TransportState::Connected;
            lifecycle.cancel = CancellationToken::new();
            lifecycle.cancel.clone()
        };

        debug!(url = %self.shared.url, push_channel = self.push_channel, "HTTP transport connected");
        if self.push_channel {
            tokio::spawn(Arc::clone(&self.shared).listen(cancel));
        }
        Ok(())
    }

    async fn send_with_timeout(
        &self,
        message: JsonRpcMessage,
        timeout: Duration,
    ) -> RpcResult<Option<Value>> {
        let body = serde_json::to_vec(&message)?;
        debug!(url = %self.shared.url, method = ?message.method(), "MCP HTTP send");

        let JsonRpcMessage::Request(request) = message else {
            ensure_connected(&self.lifecycle())?;
            self.shared.post(body, Some(timeout)).await?;
            return Ok(None);
        };

        let (pending, exchange) = {
            let lifecycle = self.lifecycle();
            ensure_connected(&lifecycle)?;
            let pending = self
                .shared
                .dispatcher
                .correlator()
                .register(request.id.clone(), &request.method, timeout)?;
            (pending, lifecycle.cancel.child_token())
        };

        // The exchange runs on its own task so a streamed body keeps being
        // dispatched after this request's response has been delivered. It is
        // abandoned when the request times out or the caller stops waiting.
        let guard = exchange.clone().drop_guard();
        let id = request.id;
        spawn_exchange(Arc::clone(&self.shared), body, exchange, move |shared, e| {
            if let Err(Err(unclaimed)) = shared.dispatcher.correlator().try_settle(&id, Err(e)) {
                shared.dispatcher.error(unclaimed);
            }
        });

        let outcome = pending.await;
        if !is_timeout(&outcome) {
            guard.disarm();
        }
        outcome.map(Some)
    }

    async fn disconnect(&self) {
        let rejected = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TransportState::Disconnected {
                return;
            }
            lifecycle.state = TransportState::Closing;
            lifecycle.cancel.cancel();
            self.shared.clear_session();
            let rejected = self
                .shared
                .dispatcher
                .correlator()
                .reject_all("transport disconnected");
            lifecycle.state = TransportState::Disconnected;
            rejected
        };
        debug!(url = %self.shared.url, rejected, "HTTP transport disconnected");
    }

    fn state(&self) -> TransportState {
        self.lifecycle().state
    }

    fn set_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.shared.dispatcher.set_observer(observer);
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

fn ensure_connected(lifecycle: &Lifecycle) -> RpcResult<()> {
    if lifecycle.state != TransportState::Connected {
        return Err(RpcError::closed(format!(
            "transport is {}, not connected",
            lifecycle.state
        )));
    }
    Ok(())
}

fn is_timeout(outcome: &RpcResult<Value>) -> bool {
    matches!(outcome, Err(e) if e.is_timeout())
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.shared.url)
            .field("headers", &self.shared.headers.keys().collect::<Vec<_>>())
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for HttpTransport
///
/// Provides a fluent API for configuring HTTP transport options.
pub struct HttpTransportBuilder {
    url: String,
    headers: HashMap<String, String>,
    timeout_secs: u64,
    connect_timeout: Duration,
    session_header: String,
    push_channel: bool,
}

impl HttpTransportBuilder {
    /// Create a new builder with the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            timeout_secs: 30,
            connect_timeout: Duration::from_secs(10),
            session_header: DEFAULT_SESSION_HEADER.to_string(),
            push_channel: false,
        }
    }

    /// Add a custom header to all requests
    ///
    /// # Arguments
    ///
    /// * `key` - Header name
    /// * `value` - Header value
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add multiple headers at once
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set the request timeout in seconds (default: 30)
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the TCP/TLS connect timeout (default: 10s)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Name of the header carrying the session id (default: `Mcp-Session-Id`)
    pub fn with_session_header(mut self, name: impl Into<String>) -> Self {
        self.session_header = name.into();
        self
    }

    /// Open a GET listener for server-initiated messages on `connect()`
    pub fn with_push_channel(mut self, enabled: bool) -> Self {
        self.push_channel = enabled;
        self
    }

    /// Build the transport
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn build(self) -> RpcResult<HttpTransport> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| RpcError::connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpTransport {
            shared: Arc::new(Shared {
                url: self.url,
                client,
                headers: self.headers,
                session_header: self.session_header,
                session_id: RwLock::new(None),
                dispatcher: Dispatcher::new(),
                exchanges: AtomicUsize::new(0),
            }),
            request_timeout: Duration::from_secs(self.timeout_secs),
            push_channel: self.push_channel,
            lifecycle: Mutex::new(Lifecycle {
                state: TransportState::Disconnected,
                cancel: CancellationToken::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_basic() {
        let transport = HttpTransport::new("https://example.com/mcp")
            .build()
            .unwrap();

        assert_eq!(transport.url(), "https://example.com/mcp");
        assert!(!transport.is_connected());
        assert!(transport.session_id().is_none());
    }

    #[test]
    fn test_builder_with_headers() {
        let transport = HttpTransport::new("https://example.com/mcp")
            .with_header("Authorization", "Bearer test-token")
            .with_header("X-Custom", "value")
            .build()
            .unwrap();

        assert_eq!(transport.shared.headers.len(), 2);
        assert_eq!(
            transport.shared.headers.get("Authorization"),
            Some(&"Bearer test-token".to_string())
        );
    }

    #[test]
    fn test_builder_with_timeout() {
        let transport = HttpTransport::new("https://example.com/mcp")
            .with_timeout_secs(60)
            .build()
            .unwrap();
        assert_eq!(transport.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_debug_format() {
        let transport = HttpTransport::new("https://example.com/mcp")
            .with_header("Authorization", "secret")
            .build()
            .unwrap();

        let debug_str = format!("{:?}", transport);
        // Should show header keys but not values (for security)
        assert!(debug_str.contains("Authorization"));
        assert!(!debug_str.contains("secret"));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = HttpTransport::new("http://127.0.0.1:9/mcp")
            .build()
            .unwrap();
        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_rejected() {
        let transport = HttpTransport::new("http://127.0.0.1:9/mcp")
            .build()
            .unwrap();
        let err = transport
            .send(JsonRpcMessage::request(1u64, "ping", None))
            .await
            .unwrap_err();
        assert!(err.is_transport_closed());
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_connect_disconnect_churn_settles_consistently() {
        let transport = Arc::new(
            HttpTransport::new("http://127.0.0.1:9/mcp")
                .build()
                .unwrap(),
        );
        let tasks: Vec<_> = (0..32)
            .map(|n| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    if n % 2 == 0 {
                        transport.connect().await.unwrap();
                    } else {
                        transport.disconnect().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let state = transport.state();
        assert!(state == TransportState::Connected || state == TransportState::Disconnected);

        transport.disconnect().await;
        assert_eq!(transport.state(), TransportState::Disconnected);
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);
        assert!(!transport.lifecycle().cancel.is_cancelled());
    }

    #[test]
    fn test_batch_error_preserves_status() {
        let err = batch_error(&RpcError::HttpStatus {
            status: 502,
            body: "bad gateway".into(),
        });
        assert!(matches!(err, RpcError::HttpStatus { status: 502, .. }));
    }
}
