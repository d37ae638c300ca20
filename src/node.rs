//! # High-Level Node API
//!
//! [`DhtNode`] combines the underlying components (discovery, routing, RPC
//! correlation) into a single unified interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Create a node on top of an owned transport
//! let node = DhtNode::new(descriptor, transport, DhtNodeConfig::default());
//!
//! // Bootstrap by joining through a known peer
//! node.join(entry_point).await?;
//!
//! // Look up the peers closest to a key
//! let closest = node.discover(target_id).await;
//!
//! // Send an application message and receive inbound ones
//! node.send(Message::new(target, b"hello".to_vec())).await?;
//! let mut rx = node.take_message_receiver().unwrap();
//! while let Some(msg) = rx.recv().await { /* ... */ }
//! ```
//!
//! The node does not own connections: the external connection manager calls
//! [`DhtNode::handle_connected`]/[`DhtNode::handle_disconnected`] as links
//! come and go, and feeds inbound frames into [`DhtNode::handle_inbound`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::contact::{ConnectionSet, PeerStore};
use crate::discovery::{DiscoveryConfig, JoinError, PeerDiscovery};
use crate::messages::{DhtRequest, DhtResponse, Message, RpcMethod};
use crate::peer::{PeerDescriptor, PeerId};
use crate::protocols::Transport;
use crate::router::Router;
use crate::rpc::{RpcCommunicator, DEFAULT_RPC_TIMEOUT};

/// Kademlia k: neighbor-list capacity and the cap on peers returned from
/// `getClosestPeers`.
pub const DEFAULT_MAX_NEIGHBORS: usize = 20;

#[derive(Clone, Debug)]
pub struct DhtNodeConfig {
    pub max_neighbors: usize,
    pub rpc_timeout: Duration,
    pub discovery: DiscoveryConfig,
}

impl Default for DhtNodeConfig {
    fn default() -> Self {
        Self {
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// A DHT overlay participant.
///
/// Cheap to clone; all clones share the same node state.
#[derive(Clone)]
pub struct DhtNode {
    local: PeerDescriptor,
    peer_store: PeerStore,
    connections: ConnectionSet,
    communicator: RpcCommunicator,
    discovery: PeerDiscovery,
    router: Router,
    entry_points: Arc<Mutex<Vec<PeerDescriptor>>>,
    join_ongoing: Arc<AtomicBool>,
    messages: Arc<Mutex<Option<mpsc::UnboundedReceiver<Message>>>>,
}

impl DhtNode {
    pub fn new(
        local: PeerDescriptor,
        transport: Arc<dyn Transport>,
        config: DhtNodeConfig,
    ) -> Self {
        let communicator = RpcCommunicator::new(local.clone(), transport, config.rpc_timeout);
        let peer_store = PeerStore::new(local.id, config.max_neighbors);
        let connections = ConnectionSet::new();
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            local.clone(),
            peer_store.clone(),
            connections.clone(),
            communicator.clone(),
            delivered_tx,
        );
        let discovery = PeerDiscovery::new(
            local.clone(),
            peer_store.clone(),
            communicator.clone(),
            connections.clone(),
            config.discovery,
        );
        let node = Self {
            local,
            peer_store,
            connections,
            communicator,
            discovery,
            router,
            entry_points: Arc::new(Mutex::new(Vec::new())),
            join_ongoing: Arc::new(AtomicBool::new(false)),
            messages: Arc::new(Mutex::new(Some(delivered_rx))),
        };
        node.register_handlers(config.max_neighbors);
        node
    }

    fn register_handlers(&self, max_neighbors: usize) {
        let store = self.peer_store.clone();
        self.communicator
            .register_method(RpcMethod::GetClosestPeers, move |from, request| {
                let store = store.clone();
                async move {
                    match request {
                        DhtRequest::GetClosestPeers { from: caller, target } => {
                            let closest: Vec<PeerDescriptor> = store
                                .closest_to(&target, max_neighbors)
                                .into_iter()
                                .filter(|d| d.id != caller.id)
                                .collect();
                            // The caller is a live peer worth knowing about.
                            store.add_contact(caller);
                            Ok(DhtResponse::Peers(closest))
                        }
                        _ => anyhow::bail!("mismatched request for getClosestPeers"),
                    }
                }
            });

        let store = self.peer_store.clone();
        self.communicator
            .register_method(RpcMethod::Ping, move |_from, request| {
                let store = store.clone();
                async move {
                    match request {
                        DhtRequest::Ping { from: caller, nonce } => {
                            store.add_contact(caller);
                            Ok(DhtResponse::Pong { nonce })
                        }
                        _ => anyhow::bail!("mismatched request for ping"),
                    }
                }
            });

        let router = self.router.clone();
        self.communicator
            .register_method(RpcMethod::RouteMessage, move |from, request| {
                let router = router.clone();
                async move {
                    match request {
                        DhtRequest::RouteMessage(routed) => Ok(DhtResponse::RouteAck(
                            router.on_route_message(from, routed).await,
                        )),
                        _ => anyhow::bail!("mismatched request for routeMessage"),
                    }
                }
            });

        let router = self.router.clone();
        self.communicator
            .register_method(RpcMethod::ForwardMessage, move |from, request| {
                let router = router.clone();
                async move {
                    match request {
                        DhtRequest::ForwardMessage(routed) => Ok(DhtResponse::RouteAck(
                            router.on_forward_message(from, routed).await,
                        )),
                        _ => anyhow::bail!("mismatched request for forwardMessage"),
                    }
                }
            });
    }

    pub(crate) fn communicator(&self) -> &RpcCommunicator {
        &self.communicator
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    pub fn id(&self) -> PeerId {
        self.local.id
    }

    pub fn peer_store(&self) -> &PeerStore {
        &self.peer_store
    }

    pub fn num_neighbors(&self) -> usize {
        self.peer_store.neighbor_count()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Feed one inbound transport frame into the node.
    pub async fn handle_inbound(&self, bytes: Vec<u8>) {
        self.communicator.handle_inbound(bytes).await;
    }

    /// Called by the connection manager when a link to `descriptor` opens.
    pub fn handle_connected(&self, descriptor: PeerDescriptor) {
        if descriptor.id == self.local.id {
            return;
        }
        debug!(peer = %descriptor.id, "peer connected");
        self.connections.on_connected(descriptor.clone());
        self.peer_store.add_contact(descriptor);
    }

    /// Called by the connection manager when the link to `id` closes.
    pub fn handle_disconnected(&self, id: &PeerId) {
        debug!(peer = %id, "peer disconnected");
        self.connections.on_disconnected(id);
    }

    /// Join the overlay through `entry_point`.
    pub async fn join(&self, entry_point: PeerDescriptor) -> Result<(), JoinError> {
        {
            let mut entry_points = self
                .entry_points
                .lock()
                .expect("entry point list lock poisoned");
            if !entry_points.iter().any(|d| d.id == entry_point.id) {
                entry_points.push(entry_point.clone());
            }
        }
        self.join_ongoing.store(true, Ordering::SeqCst);
        let result = self.discovery.join(entry_point).await;
        self.join_ongoing.store(false, Ordering::SeqCst);
        if result.is_ok() {
            info!(neighbors = self.num_neighbors(), "node joined the dht");
        }
        result
    }

    /// Iterative lookup: the closest known peers to `target` after one
    /// discovery session. Best-effort; a timed-out session still returns
    /// what it found.
    pub async fn discover(&self, target: PeerId) -> Vec<PeerDescriptor> {
        self.discovery.run_session(target, None).await.closest
    }

    /// Route an application message toward its target.
    ///
    /// While a join is still in flight the entry points travel along as
    /// reachable-through hints, so the destination can answer a node the
    /// overlay does not know how to reach yet.
    pub async fn send(&self, message: Message) -> Result<()> {
        let hints = if self.join_ongoing.load(Ordering::SeqCst) {
            self.entry_points
                .lock()
                .expect("entry point list lock poisoned")
                .clone()
        } else {
            Vec::new()
        };
        self.router.send(message, hints).await
    }

    /// The inbound application-message stream. Yields `None` after the
    /// first call; there is exactly one consumer.
    pub fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.messages
            .lock()
            .expect("message receiver lock poisoned")
            .take()
    }

    /// Stop the node: discovery, routing, and the RPC layer all reject
    /// further work and pending calls resolve with stopped errors.
    pub fn stop(&self) {
        info!(node = %self.local.id, "stopping dht node");
        self.discovery.stop();
        self.router.stop();
        self.communicator.stop();
    }
}
