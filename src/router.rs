//! # Message Router
//!
//! Hop-by-hop routing of application messages across the overlay, plus the
//! relay indirection ("forward" mode) for peers reachable only through a
//! third party.
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | Next-hop selection | [`RoutingSession`] racing parallel `routeMessage` calls |
//! | Relay indirection | forwarding table: source id to relay descriptors, 10s TTL |
//! | Loop suppression | [`DuplicateDetector`] on request ids + routing-path exclusion |
//!
//! ## Failure asymmetry
//!
//! A route that cannot even begin (no candidates) is a hard error at the
//! original source, because the caller has no further fallback there. At an
//! intermediate hop the same condition degrades to an error ack returned
//! upstream; the upstream session then tries its remaining candidates. The
//! inbound handlers therefore never propagate errors, they always produce
//! an ack.
//!
//! ## Acks are optimistic
//!
//! A success ack means a downstream session found candidates and is
//! proceeding, not that the message arrived. Once candidates exist, a later
//! all-candidates-failed outcome is not reported back upstream; the
//! first-stage race has already resolved.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace, warn};

use crate::contact::{ConnectionSet, PeerStore, SortedContactList};
use crate::dedup::{DuplicateDetector, DEFAULT_MAX_AGE, DEFAULT_MAX_VALUES};
use crate::messages::{
    Message, RequestId, RouteAck, RouteError, RoutedMessage,
};
use crate::peer::{PeerDescriptor, PeerId};
use crate::protocols::DhtRpc;
use crate::rpc::{DhtPeer, RpcCommunicator};

/// In-flight fan-out at the original source.
const SOURCE_PARALLELISM: usize = 2;

/// In-flight fan-out at a relaying hop.
const RELAY_PARALLELISM: usize = 1;

/// Capacity of a session's candidate list.
const ROUTING_CANDIDATE_LIMIT: usize = 20;

/// Bound on the wait for a session to report whether candidates exist.
const FIRST_STAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// After this, a still-running session is stopped and discarded.
const SESSION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifetime of a forwarding-table entry without refresh.
const FORWARDING_ENTRY_TTL: Duration = Duration::from_secs(10);

/// Whether a session sends `routeMessage` or `forwardMessage` hops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingMode {
    Route,
    Forward,
}

/// Terminal state of one [`RoutingSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// Some candidate acked the message onward.
    Succeeded,
    /// The candidate set was empty at session start.
    NoCandidates,
    /// Candidates existed but every one of them failed or rejected.
    Failed,
    /// The session was stopped externally before concluding.
    Stopped,
}

/// One attempt to move a message one hop closer to its destination.
///
/// Candidates are ordered by distance to the destination, never farther
/// than the previous hop, and never on the already-traversed path. The
/// session dispatches up to `parallelism` concurrent hop RPCs and concludes
/// on the first success; failures refresh the candidate pool from the live
/// connection set before trying further candidates.
pub struct RoutingSession {
    routed: RoutedMessage,
    mode: RoutingMode,
    parallelism: usize,
    candidates: SortedContactList,
    connections: ConnectionSet,
    peer_store: PeerStore,
    communicator: RpcCommunicator,
    stopped: Arc<AtomicBool>,
}

impl RoutingSession {
    fn new(
        routed: RoutedMessage,
        mode: RoutingMode,
        parallelism: usize,
        previous_hop: Option<PeerId>,
        connections: ConnectionSet,
        peer_store: PeerStore,
        communicator: RpcCommunicator,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        let target = routed.destination_peer.id;
        let mut excluded: HashSet<PeerId> = routed.routing_path.iter().map(|d| d.id).collect();
        excluded.insert(communicator.local_id());
        excluded.insert(routed.source_peer.id);
        let mut candidates = SortedContactList::new(target, ROUTING_CANDIDATE_LIMIT)
            .with_reference_id_allowed()
            .with_excluded_ids(excluded);
        // Never move backward: contacts at or beyond the previous hop's
        // distance to the target are rejected.
        if let Some(previous) = previous_hop {
            candidates = candidates.with_distance_limit(previous);
        }
        let mut session = Self {
            routed,
            mode,
            parallelism,
            candidates,
            connections,
            peer_store,
            communicator,
            stopped,
        };
        session.refresh_candidates();
        session
    }

    /// Merge the current live connections and known contacts into the
    /// candidate list. Exclusion and distance-limit rules still apply.
    fn refresh_candidates(&mut self) {
        for descriptor in self.connections.snapshot() {
            self.candidates.add_contact(descriptor);
        }
        let target = self.candidates.reference_id();
        for descriptor in self.peer_store.closest_to(&target, ROUTING_CANDIDATE_LIMIT) {
            self.candidates.add_contact(descriptor);
        }
    }

    fn has_candidates(&self) -> bool {
        self.candidates.uncontacted_count() > 0
    }

    /// Drive the session to a terminal state.
    ///
    /// `first_tx` resolves as soon as the session knows whether any viable
    /// candidate exists, before any hop RPC completes.
    async fn run(mut self, first_tx: oneshot::Sender<bool>) -> RoutingOutcome {
        let found = self.has_candidates();
        let _ = first_tx.send(found);
        if !found {
            trace!(request = %self.routed.request_id, "no routing candidates");
            return RoutingOutcome::NoCandidates;
        }

        let mut join_set: JoinSet<(PeerId, bool)> = JoinSet::new();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return RoutingOutcome::Stopped;
            }
            while join_set.len() < self.parallelism {
                let Some(next) = self.candidates.get_uncontacted_contacts(1).pop() else {
                    break;
                };
                self.candidates.set_contacted(&next.id);
                let peer = DhtPeer::new(next, self.communicator.clone());
                let routed = self.routed.clone();
                let mode = self.mode;
                join_set.spawn(async move {
                    let accepted = match mode {
                        RoutingMode::Route => peer.route_message(routed).await,
                        RoutingMode::Forward => peer.forward_message(routed).await,
                    };
                    (peer.id(), accepted)
                });
            }
            if join_set.is_empty() {
                return RoutingOutcome::Failed;
            }
            let Some(joined) = join_set.join_next().await else {
                return RoutingOutcome::Failed;
            };
            let Ok((peer_id, accepted)) = joined else {
                continue;
            };
            if accepted {
                // First success wins; remaining in-flight hops are dropped.
                trace!(
                    request = %self.routed.request_id,
                    via = %peer_id,
                    "hop accepted"
                );
                return RoutingOutcome::Succeeded;
            }
            trace!(
                request = %self.routed.request_id,
                candidate = %peer_id,
                "hop rejected or failed"
            );
            // Topology may have changed since the session started.
            self.refresh_candidates();
        }
    }
}

struct ForwardingEntry {
    relays: Vec<PeerDescriptor>,
    expiry: tokio::task::AbortHandle,
}

struct RouterInner {
    local: PeerDescriptor,
    peer_store: PeerStore,
    connections: ConnectionSet,
    communicator: RpcCommunicator,
    detector: Mutex<DuplicateDetector>,
    forwarding: Mutex<HashMap<PeerId, ForwardingEntry>>,
    sessions: Mutex<HashMap<RequestId, Arc<AtomicBool>>>,
    delivered_tx: mpsc::UnboundedSender<Message>,
    stopped: AtomicBool,
}

/// Owns the forwarding table, the duplicate detector, and the routing
/// sessions in flight; implements the `routeMessage`/`forwardMessage`
/// handlers.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        local: PeerDescriptor,
        peer_store: PeerStore,
        connections: ConnectionSet,
        communicator: RpcCommunicator,
        delivered_tx: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                local,
                peer_store,
                connections,
                communicator,
                detector: Mutex::new(DuplicateDetector::new(
                    DEFAULT_MAX_VALUES,
                    DEFAULT_MAX_AGE,
                )),
                forwarding: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                delivered_tx,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Send an application message from this node.
    ///
    /// `reachable_through` hints travel with the message so the destination
    /// learns how to reach this node back through relays. A known
    /// forwarding-table entry for the target switches the first hop to
    /// forward mode aimed at the entry's relay.
    pub async fn send(
        &self,
        mut message: Message,
        reachable_through: Vec<PeerDescriptor>,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(anyhow!("router is stopped"));
        }
        message.source = Some(self.inner.local.clone());
        let target = message.target.clone();
        if target.id == self.inner.local.id {
            self.deliver_local(message);
            return Ok(());
        }
        let own_id = self.inner.local.id;
        let reachable_through: Vec<PeerDescriptor> = reachable_through
            .into_iter()
            .filter(|d| d.id != own_id)
            .collect();

        let forward_relay = self.forwarding_relay(&target.id);
        let (destination, mode) = match forward_relay {
            Some(relay) => (relay, RoutingMode::Forward),
            None => (target, RoutingMode::Route),
        };
        let routed = RoutedMessage {
            request_id: RequestId::random(),
            message,
            source_peer: self.inner.local.clone(),
            destination_peer: destination,
            reachable_through,
            routing_path: Vec::new(),
        };
        let ack = self.do_route_message(routed, mode).await?;
        match ack.error {
            None => Ok(()),
            Some(err) => Err(anyhow!("routing failed at source: {err}")),
        }
    }

    /// Route or forward one hop, appending self to the routing path.
    ///
    /// Returns `Err` only when this node is the original source and no
    /// candidate exists; every other outcome is expressed in the ack.
    async fn do_route_message(
        &self,
        mut routed: RoutedMessage,
        mode: RoutingMode,
    ) -> Result<RouteAck> {
        let is_source = routed.source_peer.id == self.inner.local.id
            && routed.routing_path.is_empty();
        let parallelism = if is_source {
            SOURCE_PARALLELISM
        } else {
            RELAY_PARALLELISM
        };
        let request_id = routed.request_id;
        let ack_template = routed.clone();
        // The hop this message arrived from, before self is appended.
        let previous_hop = routed.previous_hop().map(|d| d.id);
        routed.routing_path.push(self.inner.local.clone());

        let session_id = RequestId::random();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let session = RoutingSession::new(
            routed,
            mode,
            parallelism,
            previous_hop,
            self.inner.connections.clone(),
            self.inner.peer_store.clone(),
            self.inner.communicator.clone(),
            stop_flag.clone(),
        );
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(session_id, stop_flag.clone());

        let (first_tx, first_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = session.run(first_tx).await;
            let _ = done_tx.send(outcome);
        });

        // Discard the session once it concludes, or stop it when the
        // cleanup deadline passes.
        let router = self.clone();
        tokio::spawn(async move {
            if timeout(SESSION_CLEANUP_TIMEOUT, done_rx).await.is_err() {
                debug!(request = %request_id, "routing session hit cleanup timeout");
                stop_flag.store(true, Ordering::SeqCst);
            }
            router
                .inner
                .sessions
                .lock()
                .expect("session table lock poisoned")
                .remove(&session_id);
        });

        let candidates_found = matches!(
            timeout(FIRST_STAGE_TIMEOUT, first_rx).await,
            Ok(Ok(true))
        );
        if candidates_found {
            return Ok(RouteAck::success(&ack_template));
        }
        if is_source {
            Err(anyhow!("no routing candidates for {}", ack_template.destination_peer.id))
        } else {
            Ok(RouteAck::failure(&ack_template, RouteError::NoTargets))
        }
    }

    /// Inbound `routeMessage` handler. Always produces an ack.
    pub async fn on_route_message(&self, from: PeerDescriptor, routed: RoutedMessage) -> RouteAck {
        if self.is_stopped() {
            return RouteAck::failure(&routed, RouteError::Stopped);
        }
        if self.check_duplicate(&routed, &from) {
            return RouteAck::failure(&routed, RouteError::Duplicate);
        }
        self.inner.peer_store.add_contact(from);

        if routed.destination_peer.id == self.inner.local.id {
            if !routed.reachable_through.is_empty() {
                self.set_forwarding_entry(
                    routed.source_peer.id,
                    routed.reachable_through.clone(),
                );
            }
            let ack = RouteAck::success(&routed);
            self.deliver_local(routed.message);
            return ack;
        }
        match self.do_route_message(routed.clone(), RoutingMode::Route).await {
            Ok(ack) => ack,
            // Not the source here, but keep the handler total anyway.
            Err(err) => {
                warn!(request = %routed.request_id, error = %err, "route continuation failed");
                RouteAck::failure(&routed, RouteError::NoTargets)
            }
        }
    }

    /// Inbound `forwardMessage` handler.
    ///
    /// When this node is the forward destination it unwraps the relay
    /// indirection: a message ultimately for self is delivered, anything
    /// else is re-routed toward the real target in route mode.
    pub async fn on_forward_message(
        &self,
        from: PeerDescriptor,
        routed: RoutedMessage,
    ) -> RouteAck {
        if self.is_stopped() {
            return RouteAck::failure(&routed, RouteError::Stopped);
        }
        if self.check_duplicate(&routed, &from) {
            return RouteAck::failure(&routed, RouteError::Duplicate);
        }
        self.inner.peer_store.add_contact(from);

        if routed.destination_peer.id == self.inner.local.id {
            let real_target = routed.message.target.clone();
            if real_target.id == self.inner.local.id {
                let ack = RouteAck::success(&routed);
                self.deliver_local(routed.message);
                return ack;
            }
            let rerouted = RoutedMessage {
                request_id: routed.request_id,
                message: routed.message.clone(),
                source_peer: routed.source_peer.clone(),
                destination_peer: real_target,
                reachable_through: routed.reachable_through.clone(),
                routing_path: routed.routing_path.clone(),
            };
            return match self.do_route_message(rerouted, RoutingMode::Route).await {
                Ok(ack) => ack,
                Err(err) => {
                    warn!(request = %routed.request_id, error = %err, "relay unwrap failed");
                    RouteAck::failure(&routed, RouteError::NoTargets)
                }
            };
        }
        match self.do_route_message(routed.clone(), RoutingMode::Forward).await {
            Ok(ack) => ack,
            Err(err) => {
                warn!(request = %routed.request_id, error = %err, "forward continuation failed");
                RouteAck::failure(&routed, RouteError::NoTargets)
            }
        }
    }

    /// True (and recorded) if this request id was already seen.
    fn check_duplicate(&self, routed: &RoutedMessage, from: &PeerDescriptor) -> bool {
        let mut detector = self
            .inner
            .detector
            .lock()
            .expect("duplicate detector lock poisoned");
        if detector.is_duplicate(&routed.request_id) {
            trace!(request = %routed.request_id, from = %from.id, "suppressing duplicate");
            return true;
        }
        detector.add(routed.request_id, from.id);
        false
    }

    fn deliver_local(&self, message: Message) {
        trace!(
            payload_len = message.payload.len(),
            "delivering message locally"
        );
        if self.inner.delivered_tx.send(message).is_err() {
            debug!("local delivery receiver dropped, discarding message");
        }
    }

    /// Install or replace the forwarding entry for `source`. Replacing
    /// cancels the previous expiry timer.
    fn set_forwarding_entry(&self, source: PeerId, relays: Vec<PeerDescriptor>) {
        let own_id = self.inner.local.id;
        let relays: Vec<PeerDescriptor> =
            relays.into_iter().filter(|d| d.id != own_id).collect();
        if relays.is_empty() {
            return;
        }
        debug!(source = %source, relays = relays.len(), "installing forwarding entry");
        let router = self.clone();
        let expiry = tokio::spawn(async move {
            sleep(FORWARDING_ENTRY_TTL).await;
            router
                .inner
                .forwarding
                .lock()
                .expect("forwarding table lock poisoned")
                .remove(&source);
        })
        .abort_handle();
        let mut table = self
            .inner
            .forwarding
            .lock()
            .expect("forwarding table lock poisoned");
        if let Some(previous) = table.insert(source, ForwardingEntry { relays, expiry }) {
            previous.expiry.abort();
        }
    }

    fn forwarding_relay(&self, target: &PeerId) -> Option<PeerDescriptor> {
        self.inner
            .forwarding
            .lock()
            .expect("forwarding table lock poisoned")
            .get(target)
            .and_then(|entry| entry.relays.first().cloned())
    }

    pub fn has_forwarding_entry(&self, target: &PeerId) -> bool {
        self.inner
            .forwarding
            .lock()
            .expect("forwarding table lock poisoned")
            .contains_key(target)
    }

    /// Stop routing: reject new sends, stop running sessions, and drop the
    /// forwarding table.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = self
            .inner
            .sessions
            .lock()
            .expect("session table lock poisoned");
        for flag in sessions.values() {
            flag.store(true, Ordering::SeqCst);
        }
        drop(sessions);
        let mut table = self
            .inner
            .forwarding
            .lock()
            .expect("forwarding table lock poisoned");
        for (_, entry) in table.drain() {
            entry.expiry.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DhtRequest, DhtResponse, RpcMethod};
    use crate::peer::PEER_ID_LENGTH;
    use crate::simulator::SimulatedNetwork;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn id(fill: u8) -> PeerId {
        PeerId::from_bytes([fill; PEER_ID_LENGTH])
    }

    fn descriptor(fill: u8) -> PeerDescriptor {
        PeerDescriptor::server(id(fill), vec![format!("10.0.0.{fill}:1")])
    }

    struct TestRouter {
        router: Router,
        delivered: UnboundedReceiver<Message>,
        store: PeerStore,
        connections: ConnectionSet,
    }

    fn make_router(network: &SimulatedNetwork, fill: u8) -> TestRouter {
        let local = descriptor(fill);
        let communicator = network.add_peer(local.clone());
        let store = PeerStore::new(local.id, 20);
        let connections = ConnectionSet::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new(
            local,
            store.clone(),
            connections.clone(),
            communicator.clone(),
            tx,
        );
        // Wire the inbound handlers the way the node does.
        let handler = router.clone();
        communicator.register_method(RpcMethod::RouteMessage, move |from, request| {
            let handler = handler.clone();
            async move {
                match request {
                    DhtRequest::RouteMessage(routed) => Ok(DhtResponse::RouteAck(
                        handler.on_route_message(from, routed).await,
                    )),
                    _ => anyhow::bail!("wrong request"),
                }
            }
        });
        let handler = router.clone();
        communicator.register_method(RpcMethod::ForwardMessage, move |from, request| {
            let handler = handler.clone();
            async move {
                match request {
                    DhtRequest::ForwardMessage(routed) => Ok(DhtResponse::RouteAck(
                        handler.on_forward_message(from, routed).await,
                    )),
                    _ => anyhow::bail!("wrong request"),
                }
            }
        });
        TestRouter {
            router,
            delivered: rx,
            store,
            connections,
        }
    }

    fn routed_to(fill_src: u8, fill_dst: u8) -> RoutedMessage {
        let mut message = Message::new(descriptor(fill_dst), b"payload".to_vec());
        message.source = Some(descriptor(fill_src));
        RoutedMessage {
            request_id: RequestId::random(),
            message,
            source_peer: descriptor(fill_src),
            destination_peer: descriptor(fill_dst),
            reachable_through: vec![],
            routing_path: vec![],
        }
    }

    #[tokio::test]
    async fn send_to_self_delivers_locally() {
        let network = SimulatedNetwork::new();
        let mut a = make_router(&network, 1);
        let message = Message::new(descriptor(1), b"loopback".to_vec());
        a.router.send(message, vec![]).await.unwrap();
        let delivered = a.delivered.recv().await.unwrap();
        assert_eq!(delivered.payload, b"loopback");
        assert_eq!(delivered.source.unwrap().id, id(1));
    }

    #[tokio::test]
    async fn send_with_no_candidates_is_hard_error_at_source() {
        let network = SimulatedNetwork::new();
        let a = make_router(&network, 1);
        let message = Message::new(descriptor(9), b"x".to_vec());
        assert!(a.router.send(message, vec![]).await.is_err());
    }

    #[tokio::test]
    async fn one_hop_route_delivers_at_destination() {
        let network = SimulatedNetwork::new();
        let a = make_router(&network, 1);
        let mut b = make_router(&network, 2);
        a.connections.on_connected(descriptor(2));

        let message = Message::new(descriptor(2), b"direct".to_vec());
        a.router.send(message, vec![]).await.unwrap();
        let delivered = b.delivered.recv().await.unwrap();
        assert_eq!(delivered.payload, b"direct");
    }

    #[tokio::test]
    async fn multi_hop_route_traverses_intermediate() {
        let network = SimulatedNetwork::new();
        let a = make_router(&network, 0x01);
        let b = make_router(&network, 0x02);
        let mut c = make_router(&network, 0x04);
        // A only knows B; B knows C.
        a.connections.on_connected(descriptor(0x02));
        b.store.add_contact(descriptor(0x04));

        let message = Message::new(descriptor(0x04), b"relayed".to_vec());
        a.router.send(message, vec![]).await.unwrap();
        let delivered = c.delivered.recv().await.unwrap();
        assert_eq!(delivered.payload, b"relayed");
        assert_eq!(delivered.source.unwrap().id, id(0x01));
    }

    #[tokio::test]
    async fn duplicate_request_id_is_suppressed() {
        let network = SimulatedNetwork::new();
        let mut b = make_router(&network, 2);
        let routed = routed_to(1, 2);

        let first = b.router.on_route_message(descriptor(1), routed.clone()).await;
        assert!(first.is_success());
        assert_eq!(b.delivered.recv().await.unwrap().payload, b"payload");

        let second = b.router.on_route_message(descriptor(1), routed).await;
        assert_eq!(second.error, Some(RouteError::Duplicate));
        assert!(b.delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn sender_is_registered_as_contact() {
        let network = SimulatedNetwork::new();
        let b = make_router(&network, 2);
        let routed = routed_to(1, 2);
        b.router.on_route_message(descriptor(1), routed).await;
        assert_eq!(b.store.neighbor_count(), 1);
    }

    #[tokio::test]
    async fn reachable_through_installs_forwarding_entry() {
        let network = SimulatedNetwork::new();
        let b = make_router(&network, 2);
        let mut routed = routed_to(1, 2);
        routed.reachable_through = vec![descriptor(3)];
        let ack = b.router.on_route_message(descriptor(3), routed).await;
        assert!(ack.is_success());
        assert!(b.router.has_forwarding_entry(&id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn forwarding_entry_expires_after_ttl() {
        let network = SimulatedNetwork::new();
        let b = make_router(&network, 2);
        let mut routed = routed_to(1, 2);
        routed.reachable_through = vec![descriptor(3)];
        b.router.on_route_message(descriptor(3), routed).await;
        assert!(b.router.has_forwarding_entry(&id(1)));

        // Let the spawned expiry task register its timer before advancing.
        tokio::task::yield_now().await;
        tokio::time::advance(FORWARDING_ENTRY_TTL).await;
        // Let the expiry task run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!b.router.has_forwarding_entry(&id(1)));
    }

    #[tokio::test]
    async fn forward_mode_unwraps_to_real_target() {
        let network = SimulatedNetwork::new();
        let a = make_router(&network, 0x01);
        let relay = make_router(&network, 0x02);
        let mut c = make_router(&network, 0x04);
        // Relay can reach C directly.
        relay.connections.on_connected(descriptor(0x04));

        // A holds a forwarding entry saying C is reachable through relay.
        a.router
            .set_forwarding_entry(id(0x04), vec![descriptor(0x02)]);
        a.connections.on_connected(descriptor(0x02));

        let message = Message::new(descriptor(0x04), b"via relay".to_vec());
        a.router.send(message, vec![]).await.unwrap();
        let delivered = c.delivered.recv().await.unwrap();
        assert_eq!(delivered.payload, b"via relay");
    }

    #[tokio::test]
    async fn intermediate_dead_end_returns_error_ack_not_panic() {
        let network = SimulatedNetwork::new();
        let b = make_router(&network, 2);
        // B has no contacts at all; destination is elsewhere.
        let routed = routed_to(1, 9);
        let ack = b.router.on_route_message(descriptor(1), routed).await;
        assert_eq!(ack.error, Some(RouteError::NoTargets));
    }

    #[tokio::test]
    async fn stopped_router_acks_not_running() {
        let network = SimulatedNetwork::new();
        let b = make_router(&network, 2);
        b.router.stop();
        let ack = b.router.on_route_message(descriptor(1), routed_to(1, 2)).await;
        assert_eq!(ack.error, Some(RouteError::Stopped));
        assert!(b
            .router
            .send(Message::new(descriptor(2), vec![]), vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn session_stops_sending_after_first_acceptance() {
        use std::sync::atomic::AtomicUsize;

        let network = SimulatedNetwork::new();
        let b = make_router(&network, 0x03);

        // Two accepting next hops, both closer to the destination than B.
        // Relaying runs one candidate at a time, so a single acceptance
        // must end the session before the second hop is ever contacted.
        let sends = Arc::new(AtomicUsize::new(0));
        for fill in [0x07u8, 0x0B] {
            let peer = network.add_peer(descriptor(fill));
            let sends = sends.clone();
            peer.register_method(RpcMethod::RouteMessage, move |_from, request| {
                let sends = sends.clone();
                async move {
                    match request {
                        DhtRequest::RouteMessage(routed) => {
                            sends.fetch_add(1, Ordering::SeqCst);
                            Ok(DhtResponse::RouteAck(RouteAck::success(&routed)))
                        }
                        _ => anyhow::bail!("wrong request"),
                    }
                }
            });
            b.store.add_contact(descriptor(fill));
        }

        let ack = b
            .router
            .on_route_message(descriptor(0x01), routed_to(0x01, 0x0F))
            .await;
        assert!(ack.is_success());

        // The ack is optimistic; wait for the hop RPC, then give the
        // background session room to misbehave before counting.
        for _ in 0..100 {
            if sends.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            sends.load(Ordering::SeqCst),
            1,
            "no further sends once a candidate accepts"
        );
    }

    #[tokio::test]
    async fn first_success_wins_among_candidates() {
        let network = SimulatedNetwork::new();
        let a = make_router(&network, 0x01);
        let accepting = make_router(&network, 0x03);
        // Second candidate exists but is unreachable; only one accept can
        // happen and the session must conclude on it.
        a.connections.on_connected(descriptor(0x03));
        a.connections.on_connected(descriptor(0x05));
        network.set_unreachable(id(0x05));
        accepting.connections.on_connected(descriptor(0x02));

        let mut dest = make_router(&network, 0x02);
        let message = Message::new(descriptor(0x02), b"race".to_vec());
        a.router.send(message, vec![]).await.unwrap();
        assert_eq!(dest.delivered.recv().await.unwrap().payload, b"race");
    }
}
