//! # Simulated Network
//!
//! In-process [`Transport`] backed by a shared peer registry. Frames are
//! delivered by invoking the receiving communicator's inbound path directly
//! on a spawned task, so whole multi-node overlays run inside one tokio
//! runtime with no sockets.
//!
//! Fault injection is per-peer: a peer can be marked unreachable (sends to
//! it fail immediately) or given an artificial receive latency. Both can be
//! changed mid-test to model churn.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::trace;

use crate::node::{DhtNode, DhtNodeConfig};
use crate::peer::{PeerDescriptor, PeerId};
use crate::protocols::Transport;
use crate::rpc::{RpcCommunicator, DEFAULT_RPC_TIMEOUT};

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerId, RpcCommunicator>,
    unreachable: HashSet<PeerId>,
    latency: HashMap<PeerId, Duration>,
}

/// Registry of simulated peers sharing one in-process medium.
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a communicator for `descriptor` wired into this network.
    pub fn add_peer(&self, descriptor: PeerDescriptor) -> RpcCommunicator {
        self.add_peer_with_timeout(descriptor, DEFAULT_RPC_TIMEOUT)
    }

    pub fn add_peer_with_timeout(
        &self,
        descriptor: PeerDescriptor,
        call_timeout: Duration,
    ) -> RpcCommunicator {
        let transport = SimulatedTransport::new(self.clone());
        let communicator = RpcCommunicator::new(descriptor, Arc::new(transport), call_timeout);
        self.register_communicator(communicator.clone());
        communicator
    }

    /// Attach an externally built communicator (e.g. a `DhtNode`'s) to the
    /// medium so frames addressed to its peer id reach it.
    pub fn register_communicator(&self, communicator: RpcCommunicator) {
        self.state
            .lock()
            .expect("network state lock poisoned")
            .peers
            .insert(communicator.local_id(), communicator);
    }

    /// Build a [`DhtNode`] wired into this network.
    pub fn add_node(&self, descriptor: PeerDescriptor) -> DhtNode {
        self.add_node_with_config(descriptor, DhtNodeConfig::default())
    }

    pub fn add_node_with_config(
        &self,
        descriptor: PeerDescriptor,
        config: DhtNodeConfig,
    ) -> DhtNode {
        let transport = Arc::new(SimulatedTransport::new(self.clone()));
        let node = DhtNode::new(descriptor, transport, config);
        self.register_communicator(node.communicator().clone());
        node
    }

    /// Drop a peer from the medium entirely.
    pub fn remove_peer(&self, id: &PeerId) {
        self.state
            .lock()
            .expect("network state lock poisoned")
            .peers
            .remove(id);
    }

    /// Sends toward `id` fail immediately until [`set_reachable`] is called.
    ///
    /// [`set_reachable`]: SimulatedNetwork::set_reachable
    pub fn set_unreachable(&self, id: PeerId) {
        self.state
            .lock()
            .expect("network state lock poisoned")
            .unreachable
            .insert(id);
    }

    pub fn set_reachable(&self, id: &PeerId) {
        self.state
            .lock()
            .expect("network state lock poisoned")
            .unreachable
            .remove(id);
    }

    /// Delay delivery of every frame addressed to `id`.
    pub fn set_latency(&self, id: PeerId, latency: Duration) {
        self.state
            .lock()
            .expect("network state lock poisoned")
            .latency
            .insert(id, latency);
    }

    fn route(&self, target: &PeerId) -> Result<(RpcCommunicator, Option<Duration>)> {
        let state = self.state.lock().expect("network state lock poisoned");
        if state.unreachable.contains(target) {
            return Err(anyhow!("peer {target} is unreachable"));
        }
        let peer = state
            .peers
            .get(target)
            .cloned()
            .ok_or_else(|| anyhow!("peer {target} not on the network"))?;
        Ok((peer, state.latency.get(target).copied()))
    }
}

/// Per-peer transport handle onto a [`SimulatedNetwork`].
pub struct SimulatedTransport {
    network: SimulatedNetwork,
}

impl SimulatedTransport {
    pub fn new(network: SimulatedNetwork) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, target: &PeerDescriptor, bytes: Vec<u8>) -> Result<()> {
        let (peer, latency) = self.network.route(&target.id)?;
        trace!(to = %target.id, len = bytes.len(), "simulated delivery");
        tokio::spawn(async move {
            if let Some(latency) = latency {
                sleep(latency).await;
            }
            peer.handle_inbound(bytes).await;
        });
        Ok(())
    }
}
