//! Request correlation
//!
//! Maps outstanding request ids to the callers waiting on them. Each entry is
//! plain data (method, timeout, timer handle, oneshot responder) in a map owned
//! by one transport instance, so teardown can walk it deterministically.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::protocol::{RequestId, RpcError, RpcResult};

type PendingMap = HashMap<RequestId, PendingRequest>;

struct PendingRequest {
    method: String,
    timeout: Duration,
    timer: AbortHandle,
    responder: oneshot::Sender<RpcResult<Value>>,
}

/// Shared id → waiter table used by both transports.
///
/// Cloning is cheap and every clone refers to the same table.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<PendingMap>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and arm its timer.
    ///
    /// Must be called from within a tokio runtime. The returned future settles
    /// with the response, the remote error, a timeout, or a closed transport.
    pub fn register(
        &self,
        id: RequestId,
        method: impl Into<String>,
        timeout: Duration,
    ) -> RpcResult<PendingResponse> {
        let method = method.into();
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(RpcError::DuplicateRequestId(id));
        }

        let (responder, receiver) = oneshot::channel();
        let table = Arc::downgrade(&self.pending);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&table, &timer_id);
        })
        .abort_handle();

        trace!(id = %id, method = %method, ?timeout, "registered pending request");
        pending.insert(
            id.clone(),
            PendingRequest {
                method,
                timeout,
                timer,
                responder,
            },
        );

        Ok(PendingResponse { id, receiver })
    }

    /// Resolve or reject the request with this id.
    ///
    /// Returns `false` when no such request is pending; a late or duplicate
    /// response is therefore harmless.
    pub fn settle(&self, id: &RequestId, outcome: RpcResult<Value>) -> bool {
        self.try_settle(id, outcome).is_ok()
    }

    /// Like [`settle`](Self::settle), but hands the outcome back when no
    /// request with this id is pending, so the caller can route it elsewhere.
    pub fn try_settle(
        &self,
        id: &RequestId,
        outcome: RpcResult<Value>,
    ) -> Result<(), RpcResult<Value>> {
        let Some(entry) = self.lock().remove(id) else {
            trace!(id = %id, "no pending request for id");
            return Err(outcome);
        };
        entry.timer.abort();
        trace!(id = %id, method = %entry.method, ok = outcome.is_ok(), "settled pending request");
        let _ = entry.responder.send(outcome);
        Ok(())
    }

    /// Reject a single pending request.
    pub fn reject(&self, id: &RequestId, error: RpcError) -> bool {
        self.settle(id, Err(error))
    }

    /// Reject every pending request with a transport-closed error.
    ///
    /// Returns how many requests were rejected.
    pub fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            debug!(id = %id, method = %entry.method, reason, "rejecting pending request");
            let _ = entry.responder.send(Err(RpcError::closed(reason)));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.len())
            .finish()
    }
}

fn expire(table: &Weak<Mutex<PendingMap>>, id: &RequestId) {
    let Some(table) = table.upgrade() else {
        return;
    };
    let entry = table
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(id);
    if let Some(entry) = entry {
        debug!(id = %id, method = %entry.method, timeout = ?entry.timeout, "request timed out");
        let _ = entry.responder.send(Err(RpcError::RequestTimeout {
            method: entry.method,
            timeout: entry.timeout,
        }));
    }
}

/// Awaitable handed back by [`RequestCorrelator::register`].
#[derive(Debug)]
pub struct PendingResponse {
    id: RequestId,
    receiver: oneshot::Receiver<RpcResult<Value>>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = RpcResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(RpcError::closed("request dropped by transport")))
        })
    }
}

/// Monotonic numeric id source, starting at 1.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
