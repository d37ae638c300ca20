//! # Xorlay - Kademlia-Style DHT Overlay Library
//!
//! Xorlay implements the routing and discovery core of a structured
//! overlay network:
//!
//! - **Identity**: fixed-length peer ids with an XOR distance metric
//! - **Discovery**: iterative closest-node lookups and a join/rejoin lifecycle
//! - **Routing**: hop-by-hop message routing with relay indirection and
//!   duplicate suppression
//! - **RPC**: request/response correlation with timeouts over a pluggable
//!   byte transport
//!
//! ## Architecture
//!
//! Components are cheap-to-clone handles over shared state. Sessions
//! (discovery lookups, routing attempts) are one-shot state machines that
//! report completion through typed channels rather than ambient callbacks.
//! The library owns no sockets: a [`protocols::Transport`] implementation
//! moves bytes, and whatever owns it feeds inbound frames back in through
//! [`node::DhtNode::handle_inbound`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `peer` | Peer ids, XOR distance, addressing descriptors |
//! | `contact` | Distance-ordered and random contact lists, peer store |
//! | `dedup` | Bounded probabilistic duplicate suppression |
//! | `discovery` | Iterative lookups, join/rejoin lifecycle |
//! | `router` | Routing/forwarding sessions and the forwarding table |
//! | `rpc` | Request correlation, method dispatch, remote-peer handles |
//! | `protocols` | Transport and RPC trait seams |
//! | `messages` | Serialization types for all wire records |
//! | `simulator` | In-process transport for multi-node tests |

mod contact;
mod dedup;
mod discovery;
mod messages;
mod node;
mod peer;
mod protocols;
mod router;
mod rpc;
pub mod simulator;

pub use contact::{ConnectionSet, ContactEvent, PeerStore, RandomContactList, SortedContactList};
pub use dedup::DuplicateDetector;
pub use discovery::{
    DiscoveryConfig, DiscoveryResult, DiscoverySession, JoinError, PeerDiscovery,
};
pub use messages::{
    DhtRequest, DhtResponse, Message, RequestId, RouteAck, RouteError, RoutedMessage,
    RpcEnvelope, RpcErrorCode, RpcMethod, MAX_PAYLOAD_SIZE,
};
pub use node::{DhtNode, DhtNodeConfig, DEFAULT_MAX_NEIGHBORS};
pub use peer::{
    distance_cmp, InvalidPeerId, NodeType, PeerDescriptor, PeerId, PEER_ID_LENGTH,
};
pub use protocols::{DhtRpc, Transport};
pub use router::Router;
pub use rpc::{DhtPeer, RpcCommunicator, RpcError, DEFAULT_RPC_TIMEOUT};
