//! # RPC Correlation Layer
//!
//! Matches outgoing requests to incoming responses by request id, enforces
//! per-call timeouts, and dispatches inbound requests to registered method
//! handlers.
//!
//! ## Outgoing calls
//!
//! [`RpcCommunicator::call`] generates a random request id, registers a
//! pending-response slot, serializes the envelope, and hands the bytes to
//! the [`Transport`]. The call resolves when a correlated response arrives
//! or the timeout fires, whichever is first.
//!
//! ## Inbound dispatch
//!
//! Whatever owns the transport feeds raw bytes into
//! [`RpcCommunicator::handle_inbound`]. Responses resolve their pending
//! slot; requests run the registered handler and send back a correlated
//! response (or a typed error response for unknown methods and handler
//! failures). Handlers never propagate errors past the dispatch boundary.
//!
//! ## Remote peers
//!
//! [`DhtPeer`] binds a peer descriptor to a communicator and exposes the
//! typed [`DhtRpc`] surface. Transport failures and error acks surface as
//! session-local "this contact failed" signals, never as panics or
//! unhandled errors.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::messages::{
    deserialize_envelope, serialize_envelope, DhtRequest, DhtResponse, RequestId, RpcEnvelope,
    RpcErrorCode, RpcMethod,
};
use crate::peer::{PeerDescriptor, PeerId};
use crate::protocols::{DhtRpc, Transport};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

/// Default bound on one outgoing RPC call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure classes an RPC call can resolve with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No response arrived before the local timeout fired.
    Timeout,
    /// The communicator was stopped while the call was pending, or the
    /// call was made after `stop()`.
    Stopped,
    /// The transport refused the outgoing bytes.
    Transport(String),
    /// The remote reported a timeout processing the request.
    RemoteTimeout,
    /// The remote has no handler for the method.
    UnknownMethod,
    /// The remote handler failed.
    ServerError(String),
    /// The request could not be serialized, or the response body did not
    /// match the request method.
    Codec(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout => write!(f, "rpc timed out"),
            RpcError::Stopped => write!(f, "rpc communicator stopped"),
            RpcError::Transport(err) => write!(f, "transport error: {err}"),
            RpcError::RemoteTimeout => write!(f, "remote reported timeout"),
            RpcError::UnknownMethod => write!(f, "remote has no handler for method"),
            RpcError::ServerError(err) => write!(f, "remote handler failed: {err}"),
            RpcError::Codec(err) => write!(f, "codec error: {err}"),
        }
    }
}

impl std::error::Error for RpcError {}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<DhtResponse>> + Send>>;
type MethodHandler = Arc<dyn Fn(PeerDescriptor, DhtRequest) -> HandlerFuture + Send + Sync>;

struct CommunicatorInner {
    local: PeerDescriptor,
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Result<DhtResponse, RpcError>>>>,
    handlers: Mutex<HashMap<RpcMethod, MethodHandler>>,
    stopped: AtomicBool,
    call_timeout: Duration,
}

/// Request/response correlation over a byte transport.
///
/// Cheap to clone; all clones share the pending map and handler registry.
#[derive(Clone)]
pub struct RpcCommunicator {
    inner: Arc<CommunicatorInner>,
}

impl RpcCommunicator {
    pub fn new(
        local: PeerDescriptor,
        transport: Arc<dyn Transport>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CommunicatorInner {
                local,
                transport,
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                call_timeout,
            }),
        }
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.inner.local
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local.id
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Register the handler for one RPC method, replacing any previous one.
    pub fn register_method<F, Fut>(&self, method: RpcMethod, handler: F)
    where
        F: Fn(PeerDescriptor, DhtRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DhtResponse>> + Send + 'static,
    {
        let handler: MethodHandler =
            Arc::new(move |from, request| Box::pin(handler(from, request)) as HandlerFuture);
        self.inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .insert(method, handler);
    }

    /// Issue one request and await its correlated response.
    pub async fn call(
        &self,
        target: &PeerDescriptor,
        body: DhtRequest,
    ) -> Result<DhtResponse, RpcError> {
        if self.is_stopped() {
            return Err(RpcError::Stopped);
        }
        let id = RequestId::random();
        let method = body.method();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(id, tx);

        let envelope = RpcEnvelope::Request {
            id,
            from: self.inner.local.clone(),
            body,
        };
        let bytes = match serialize_envelope(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.take_pending(&id);
                return Err(RpcError::Codec(err.to_string()));
            }
        };

        trace!(request = %id, %method, to = %target.id, "sending rpc request");
        if let Err(err) = self.inner.transport.send(target, bytes).await {
            self.take_pending(&id);
            return Err(RpcError::Transport(err.to_string()));
        }

        match timeout(self.inner.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a resolution: stop() raced us.
            Ok(Err(_)) => Err(RpcError::Stopped),
            Err(_) => {
                self.take_pending(&id);
                debug!(request = %id, %method, to = %target.id, "rpc request timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Process one inbound frame from the transport.
    ///
    /// Never returns an error to the transport: malformed frames are logged
    /// and dropped, handler failures become error responses.
    pub async fn handle_inbound(&self, bytes: Vec<u8>) {
        if self.is_stopped() {
            return;
        }
        let envelope = match deserialize_envelope(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(error = %err, len = bytes.len(), "dropping undecodable inbound frame");
                return;
            }
        };
        match envelope {
            RpcEnvelope::Request { id, from, body } => {
                self.dispatch_request(id, from, body).await;
            }
            RpcEnvelope::Response { id, result } => {
                self.resolve_pending(id, result);
            }
        }
    }

    async fn dispatch_request(&self, id: RequestId, from: PeerDescriptor, body: DhtRequest) {
        let method = body.method();
        let handler = self
            .inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .get(&method)
            .cloned();
        let result = match handler {
            Some(handler) => match handler(from.clone(), body).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    debug!(%method, error = %err, "rpc handler failed");
                    Err(RpcErrorCode::ServerError(err.to_string()))
                }
            },
            None => {
                debug!(%method, from = %from.id, "no handler registered for rpc method");
                Err(RpcErrorCode::UnknownMethod)
            }
        };
        let envelope = RpcEnvelope::Response { id, result };
        let bytes = match serialize_envelope(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(request = %id, error = %err, "failed to serialize rpc response");
                return;
            }
        };
        if let Err(err) = self.inner.transport.send(&from, bytes).await {
            debug!(request = %id, to = %from.id, error = %err, "failed to send rpc response");
        }
    }

    fn resolve_pending(&self, id: RequestId, result: Result<DhtResponse, RpcErrorCode>) {
        let Some(tx) = self.take_pending(&id) else {
            trace!(request = %id, "dropping late or unknown rpc response");
            return;
        };
        let mapped = result.map_err(|code| match code {
            RpcErrorCode::RemoteTimeout => RpcError::RemoteTimeout,
            RpcErrorCode::UnknownMethod => RpcError::UnknownMethod,
            RpcErrorCode::ServerError(err) => RpcError::ServerError(err),
        });
        let _ = tx.send(mapped);
    }

    fn take_pending(
        &self,
        id: &RequestId,
    ) -> Option<oneshot::Sender<Result<DhtResponse, RpcError>>> {
        self.inner
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(id)
    }

    /// Reject all pending calls with [`RpcError::Stopped`] and clear the
    /// handler registry. No further sends are possible afterwards.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<_> = {
            let mut map = self.inner.pending.lock().expect("pending map lock poisoned");
            map.drain().collect()
        };
        for (id, tx) in pending {
            trace!(request = %id, "rejecting pending rpc on stop");
            let _ = tx.send(Err(RpcError::Stopped));
        }
        self.inner
            .handlers
            .lock()
            .expect("handler registry lock poisoned")
            .clear();
    }
}

/// Remote-peer handle: a descriptor plus the RPC client bound to it.
///
/// Value-like and cheap to recreate from the same descriptor; sessions
/// construct these on demand from contact-list entries.
#[derive(Clone)]
pub struct DhtPeer {
    descriptor: PeerDescriptor,
    communicator: RpcCommunicator,
}

impl DhtPeer {
    pub fn new(descriptor: PeerDescriptor, communicator: RpcCommunicator) -> Self {
        Self {
            descriptor,
            communicator,
        }
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> PeerId {
        self.descriptor.id
    }
}

#[async_trait]
impl DhtRpc for DhtPeer {
    async fn get_closest_peers(&self, target: PeerId) -> Result<Vec<PeerDescriptor>> {
        let request = DhtRequest::GetClosestPeers {
            from: self.communicator.local().clone(),
            target,
        };
        match self.communicator.call(&self.descriptor, request).await? {
            DhtResponse::Peers(peers) => Ok(peers),
            other => Err(RpcError::Codec(format!(
                "unexpected response to getClosestPeers: {other:?}"
            ))
            .into()),
        }
    }

    async fn route_message(&self, routed: crate::messages::RoutedMessage) -> bool {
        let request = DhtRequest::RouteMessage(routed);
        match self.communicator.call(&self.descriptor, request).await {
            Ok(DhtResponse::RouteAck(ack)) => ack.is_success(),
            Ok(_) | Err(_) => false,
        }
    }

    async fn forward_message(&self, routed: crate::messages::RoutedMessage) -> bool {
        let request = DhtRequest::ForwardMessage(routed);
        match self.communicator.call(&self.descriptor, request).await {
            Ok(DhtResponse::RouteAck(ack)) => ack.is_success(),
            Ok(_) | Err(_) => false,
        }
    }

    async fn ping(&self) -> bool {
        let nonce: u64 = rand::random();
        let request = DhtRequest::Ping {
            from: self.communicator.local().clone(),
            nonce,
        };
        match self.communicator.call(&self.descriptor, request).await {
            Ok(DhtResponse::Pong { nonce: echoed }) => echoed == nonce,
            Ok(_) | Err(_) => false,
        }
    }
}
