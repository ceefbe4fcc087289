//! Inbound routing and observer registration
//!
//! Every message a transport decodes goes through [`Dispatcher::deliver`]:
//! responses whose id is pending settle that request, everything else
//! (server notifications, server-initiated requests, uncorrelated responses)
//! goes to the registered [`TransportObserver`].

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::correlator::RequestCorrelator;
use crate::protocol::{
    error_codes, JsonRpcError, JsonRpcMessage, JsonRpcResponse, RequestId, RpcError, RpcResult,
};

/// How the underlying connection ended
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// Process exit code, when there was one
    pub code: Option<i32>,
    /// Terminating signal number (unix)
    pub signal: Option<i32>,
    /// `true` when the close was initiated by `disconnect()`
    pub requested: bool,
}

impl std::fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "closed"),
        }
    }
}

/// Receiver of unsolicited inbound traffic and transport-level faults.
///
/// All methods default to no-ops; implement the ones you care about.
pub trait TransportObserver: Send + Sync {
    /// A message that did not settle a pending request
    fn on_message(&self, _message: JsonRpcMessage) {}

    /// A transport-scoped fault (bad frame, stderr output, dropped stream)
    fn on_error(&self, _error: RpcError) {}

    /// The underlying connection went away
    fn on_close(&self, _info: CloseInfo) {}
}

/// Event forwarded by [`ChannelObserver`]
#[derive(Debug)]
pub enum TransportEvent {
    Message(JsonRpcMessage),
    Error(RpcError),
    Closed(CloseInfo),
}

/// Observer that queues every event on an unbounded channel for the caller
/// to drain.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl TransportObserver for ChannelObserver {
    fn on_message(&self, message: JsonRpcMessage) {
        let _ = self.tx.send(TransportEvent::Message(message));
    }

    fn on_error(&self, error: RpcError) {
        let _ = self.tx.send(TransportEvent::Error(error));
    }

    fn on_close(&self, info: CloseInfo) {
        let _ = self.tx.send(TransportEvent::Closed(info));
    }
}

/// Correlator plus observer slot, shared by a transport and its I/O tasks.
#[derive(Clone, Default)]
pub struct Dispatcher {
    correlator: RequestCorrelator,
    observer: Arc<RwLock<Option<Arc<dyn TransportObserver>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    pub fn set_observer(&self, observer: Arc<dyn TransportObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn TransportObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route one decoded message.
    pub fn deliver(&self, message: JsonRpcMessage) {
        let message = match message {
            JsonRpcMessage::Response(response) => match response.id.clone() {
                Some(id) => {
                    let outcome = response.into_result().map_err(RpcError::Remote);
                    match self.correlator.try_settle(&id, outcome) {
                        Ok(()) => return,
                        // Unknown, timed out, or already settled.
                        Err(unclaimed) => JsonRpcMessage::Response(rebuild_response(id, unclaimed)),
                    }
                }
                None => JsonRpcMessage::Response(response),
            },
            other => other,
        };

        match self.observer() {
            Some(observer) => observer.on_message(message),
            None => trace!(method = ?message.method(), "no observer registered, dropping message"),
        }
    }

    /// Route a decoder result: messages are delivered, errors reported.
    pub fn deliver_parsed(&self, parsed: RpcResult<JsonRpcMessage>) {
        match parsed {
            Ok(message) => self.deliver(message),
            Err(error) => {
                warn!(error = %error, "discarding undecodable inbound message");
                self.error(error);
            }
        }
    }

    /// Report a transport-scoped fault.
    pub fn error(&self, error: RpcError) {
        match self.observer() {
            Some(observer) => observer.on_error(error),
            None => debug!(error = %error, "no observer registered for transport error"),
        }
    }

    /// Report that the connection closed.
    pub fn closed(&self, info: CloseInfo) {
        if let Some(observer) = self.observer() {
            observer.on_close(info);
        }
    }
}

fn rebuild_response(id: RequestId, outcome: RpcResult<Value>) -> JsonRpcResponse {
    match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(RpcError::Remote(error)) => JsonRpcResponse::failure(Some(id), error),
        Err(other) => JsonRpcResponse::failure(
            Some(id),
            JsonRpcError::new(error_codes::INTERNAL_ERROR, other.to_string()),
        ),
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("correlator", &self.correlator)
            .field("has_observer", &self.observer().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_response_settles_pending_request() {
        let dispatcher = Dispatcher::new();
        let (observer, mut events) = ChannelObserver::new();
        dispatcher.set_observer(observer);

        let pending = dispatcher
            .correlator()
            .register(1u64.into(), "ping", Duration::from_secs(5))
            .unwrap();
        dispatcher.deliver(JsonRpcMessage::Response(JsonRpcResponse::success(
            1u64,
            json!("pong"),
        )));

        assert_eq!(pending.await.unwrap(), json!("pong"));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_response_rejects_with_remote_error() {
        let dispatcher = Dispatcher::new();
        let pending = dispatcher
            .correlator()
            .register(9u64.into(), "fail", Duration::from_secs(5))
            .unwrap();
        dispatcher.deliver(JsonRpcMessage::Response(JsonRpcResponse::failure(
            Some(9u64.into()),
            JsonRpcError::new(-32001, "nope"),
        )));

        let err = pending.await.unwrap_err();
        assert_eq!(err.remote_error().unwrap().message, "nope");
    }

    #[tokio::test]
    async fn test_unsolicited_messages_go_to_observer_in_order() {
        let dispatcher = Dispatcher::new();
        let (observer, mut events) = ChannelObserver::new();
        dispatcher.set_observer(observer);

        dispatcher.deliver(JsonRpcMessage::notification("first", None));
        dispatcher.deliver(JsonRpcMessage::Response(JsonRpcResponse::success(
            77u64,
            json!(null),
        )));
        dispatcher.deliver_parsed(Err(RpcError::protocol("bad")));

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Message(m)) if m.method() == Some("first")
        ));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Message(m)) if m.is_response()
        ));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Error(e)) if e.is_protocol()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_timeout_goes_to_observer() {
        let dispatcher = Dispatcher::new();
        let (observer, mut events) = ChannelObserver::new();
        dispatcher.set_observer(observer);

        let pending = dispatcher
            .correlator()
            .register(4u64.into(), "slow", Duration::from_millis(20))
            .unwrap();
        assert!(pending.await.unwrap_err().is_timeout());

        dispatcher.deliver(JsonRpcMessage::Response(JsonRpcResponse::success(
            4u64,
            json!({"late": true}),
        )));
        match events.recv().await {
            Some(TransportEvent::Message(JsonRpcMessage::Response(response))) => {
                assert_eq!(response.id, Some(4u64.into()));
                assert_eq!(response.result, Some(json!({"late": true})));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_close_info_display() {
        let exited = CloseInfo {
            code: Some(3),
            ..CloseInfo::default()
        };
        assert_eq!(exited.to_string(), "exited with code 3");
        let signalled = CloseInfo {
            signal: Some(15),
            ..CloseInfo::default()
        };
        assert_eq!(signalled.to_string(), "terminated by signal 15");
    }
}
