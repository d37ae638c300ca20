//! # Wire Records
//!
//! Serializable records exchanged between overlay nodes. Serialization uses
//! bincode with size limits so a malicious peer cannot trigger unbounded
//! allocation during decode.
//!
//! | Concern | Types |
//! |---------|-------|
//! | Application payload | [`Message`] |
//! | Hop-by-hop routing envelope | [`RoutedMessage`], [`RouteAck`], [`RouteError`] |
//! | RPC framing | [`RpcEnvelope`], [`DhtRequest`], [`DhtResponse`], [`RpcErrorCode`] |
//!
//! The routing core treats `Message::payload` as opaque bytes; the concrete
//! application encoding is a collaborator's concern.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::peer::{PeerDescriptor, PeerId};

/// Maximum size of an application payload carried through the router (1 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than the payload cap to allow for envelope overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// Always use this for deserialization of peer-supplied bytes.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_envelope(envelope: &RpcEnvelope) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(envelope)
}

pub fn deserialize_envelope(bytes: &[u8]) -> Result<RpcEnvelope, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Correlation key for an outgoing request or a routed message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId([u8; 16]);

impl RequestId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Application message handed to the router for delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub target: PeerDescriptor,
    /// Stamped by the router at the original source.
    pub source: Option<PeerDescriptor>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(target: PeerDescriptor, payload: Vec<u8>) -> Self {
        Self {
            target,
            source: None,
            payload,
        }
    }
}

/// Hop-by-hop routing envelope wrapped around a [`Message`].
///
/// `routing_path` accumulates one descriptor per hop; the previous hop is
/// its last element. `reachable_through` lets the destination install a
/// forwarding-table entry pointing back at the source through relays.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub request_id: RequestId,
    pub message: Message,
    pub source_peer: PeerDescriptor,
    pub destination_peer: PeerDescriptor,
    pub reachable_through: Vec<PeerDescriptor>,
    pub routing_path: Vec<PeerDescriptor>,
}

impl RoutedMessage {
    /// The hop this message arrived from, if any.
    pub fn previous_hop(&self) -> Option<&PeerDescriptor> {
        self.routing_path.last()
    }
}

/// Typed error carried on a [`RouteAck`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteError {
    /// The handling node has been stopped.
    Stopped,
    /// The request id was recently seen; the message is most likely a
    /// duplicate arriving over another path.
    Duplicate,
    /// No viable next-hop candidate was found.
    NoTargets,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Stopped => write!(f, "node is not running"),
            RouteError::Duplicate => write!(f, "message is likely a duplicate"),
            RouteError::NoTargets => write!(f, "no routing candidates found"),
        }
    }
}

/// Acknowledgement for a `routeMessage`/`forwardMessage` call.
///
/// A successful ack means downstream routing is proceeding, not that the
/// message has reached its destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteAck {
    pub request_id: RequestId,
    pub error: Option<RouteError>,
}

impl RouteAck {
    pub fn success(routed: &RoutedMessage) -> Self {
        Self {
            request_id: routed.request_id,
            error: None,
        }
    }

    pub fn failure(routed: &RoutedMessage, error: RouteError) -> Self {
        Self {
            request_id: routed.request_id,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// RPC method selector, used for handler registration and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    GetClosestPeers,
    RouteMessage,
    ForwardMessage,
    Ping,
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RpcMethod::GetClosestPeers => "getClosestPeers",
            RpcMethod::RouteMessage => "routeMessage",
            RpcMethod::ForwardMessage => "forwardMessage",
            RpcMethod::Ping => "ping",
        };
        write!(f, "{name}")
    }
}

/// Request body for the DHT RPC surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    GetClosestPeers {
        from: PeerDescriptor,
        target: PeerId,
    },
    RouteMessage(RoutedMessage),
    ForwardMessage(RoutedMessage),
    Ping {
        from: PeerDescriptor,
        nonce: u64,
    },
}

impl DhtRequest {
    pub fn method(&self) -> RpcMethod {
        match self {
            DhtRequest::GetClosestPeers { .. } => RpcMethod::GetClosestPeers,
            DhtRequest::RouteMessage(_) => RpcMethod::RouteMessage,
            DhtRequest::ForwardMessage(_) => RpcMethod::ForwardMessage,
            DhtRequest::Ping { .. } => RpcMethod::Ping,
        }
    }
}

/// Response body for the DHT RPC surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Peers(Vec<PeerDescriptor>),
    RouteAck(RouteAck),
    Pong { nonce: u64 },
}

/// Error code carried on an RPC error response.
///
/// Distinguishes the remote-side failure classes the correlation layer must
/// surface separately to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorCode {
    /// The remote timed out processing the request.
    RemoteTimeout,
    /// No handler is registered for the requested method.
    UnknownMethod,
    /// The remote handler failed.
    ServerError(String),
}

/// Framing for all bytes handed to the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcEnvelope {
    Request {
        id: RequestId,
        from: PeerDescriptor,
        body: DhtRequest,
    },
    Response {
        id: RequestId,
        result: Result<DhtResponse, RpcErrorCode>,
    },
}
