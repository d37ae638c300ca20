//! Protocol trait definitions for the overlay's networking seams.
//!
//! Two traits separate the routing core from its external collaborators:
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`Transport`] | connection layer (or the test simulator) | move raw bytes to a peer |
//! | [`DhtRpc`] | [`crate::rpc::DhtPeer`] | typed RPC surface sessions call on remote peers |
//!
//! The core never opens connections or encodes frames itself; it hands
//! serialized envelopes to `Transport::send` and receives inbound bytes via
//! `RpcCommunicator::handle_inbound`. Discovery and routing sessions depend
//! only on `DhtRpc`, so tests can substitute arbitrary peer behavior.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::RoutedMessage;
use crate::peer::{PeerDescriptor, PeerId};

/// Byte-level transport seam.
///
/// Delivery is best-effort and collaborator-defined: an `Ok` return means
/// the bytes were accepted for sending, not that they arrived. The
/// transport (or whatever owns it) must feed inbound bytes back into
/// `RpcCommunicator::handle_inbound`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: &PeerDescriptor, bytes: Vec<u8>) -> Result<()>;
}

/// DHT node operations invoked on a remote peer.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// Ask the peer for the closest peers to `target` it knows of.
    async fn get_closest_peers(&self, target: PeerId) -> Result<Vec<PeerDescriptor>>;

    /// Forward an application message one hop in route mode.
    ///
    /// Returns `true` iff the peer acked that downstream routing is
    /// proceeding. Transport failures and error acks both read as `false`;
    /// sessions treat them identically.
    async fn route_message(&self, routed: RoutedMessage) -> bool;

    /// Forward an application message one hop in forward (relay) mode.
    async fn forward_message(&self, routed: RoutedMessage) -> bool;

    /// Liveness check.
    async fn ping(&self) -> bool;
}
