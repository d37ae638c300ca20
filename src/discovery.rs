//! # Peer Discovery
//!
//! Iterative closest-node lookups and the join/rejoin lifecycle that keeps
//! a node a member of the overlay.
//!
//! ## DiscoverySession
//!
//! One run of the iterative lookup against a fixed target id. The session
//! keeps a working [`SortedContactList`] and a pool of in-flight
//! `getClosestPeers` calls, continuously topped up to `parallelism` as
//! slots free (no lockstep rounds). Failed peers are excluded from the
//! working list for the rest of the session; the session terminates when
//! the uncontacted set and the in-flight pool both drain, when the closest
//! known id stops improving for `no_progress_limit` consecutive responses,
//! when the wall-clock deadline passes, or when stopped externally.
//!
//! ## PeerDiscovery
//!
//! Drives sessions: `join` runs a self-lookup and a random-id lookup
//! concurrently through an entry point (the classic bucket-populating
//! lookup plus one that widens topology knowledge), then either starts the
//! periodic closest-neighbor refresh or schedules a rejoin. Rejoin is a
//! single-flight, indefinitely retrying loop: a DHT node keeps trying to
//! get back into the network until it is stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::contact::{ConnectionSet, PeerStore, SortedContactList};
use crate::messages::RequestId;
use crate::peer::{PeerDescriptor, PeerId};
use crate::protocols::DhtRpc;
use crate::rpc::{DhtPeer, RpcCommunicator};

/// Max concurrently in-flight lookups per session (Kademlia α).
pub const DEFAULT_PARALLELISM: usize = 3;

/// Responses without closest-id improvement before a lookup gives up.
pub const DEFAULT_NO_PROGRESS_LIMIT: usize = 5;

/// Wall-clock bound on one join attempt (both lookups together).
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before rejoining when a join leaves the routing table empty.
const REJOIN_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Backoff between rejoin attempts.
const REJOIN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Interval of the closest-neighbors refresh after a successful join.
const NEIGHBOR_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for discovery sessions and the join lifecycle.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub parallelism: usize,
    pub no_progress_limit: usize,
    pub join_timeout: Duration,
    /// Capacity of a session's working contact list (Kademlia k).
    pub lookup_list_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            no_progress_limit: DEFAULT_NO_PROGRESS_LIMIT,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            lookup_list_size: 20,
        }
    }
}

/// Why a `join` attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The lookups did not finish within the join timeout.
    Timeout,
    /// The discovery component was stopped.
    Stopped,
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinError::Timeout => write!(f, "dht join timed out"),
            JoinError::Stopped => write!(f, "peer discovery stopped"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Outcome of one lookup run: the best-known closest set plus whether the
/// wall clock cut the session short. Join treats a timeout as fatal; plain
/// lookups keep the partial results.
#[derive(Debug)]
pub struct DiscoveryResult {
    pub closest: Vec<PeerDescriptor>,
    pub timed_out: bool,
}

/// One iterative closest-node lookup.
pub struct DiscoverySession {
    target: PeerId,
    parallelism: usize,
    no_progress_limit: usize,
    peer_store: PeerStore,
    communicator: RpcCommunicator,
    contact_list: SortedContactList,
    stopped: Arc<AtomicBool>,
}

impl DiscoverySession {
    pub fn new(
        target: PeerId,
        config: &DiscoveryConfig,
        peer_store: PeerStore,
        communicator: RpcCommunicator,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        let mut contact_list =
            SortedContactList::new(target, config.lookup_list_size).with_reference_id_allowed();
        for descriptor in peer_store.closest_to(&target, config.lookup_list_size) {
            contact_list.add_contact(descriptor);
        }
        Self {
            target,
            parallelism: config.parallelism,
            no_progress_limit: config.no_progress_limit,
            peer_store,
            communicator,
            contact_list,
            stopped,
        }
    }

    /// Seed an additional starting contact (the join entry point).
    pub fn seed(&mut self, descriptor: PeerDescriptor) {
        if descriptor.id != self.communicator.local_id() {
            self.contact_list.add_contact(descriptor);
        }
    }

    /// Run the lookup to completion or until `timeout` elapses.
    pub async fn find_closest_nodes(mut self, timeout: Duration) -> DiscoveryResult {
        let own_id = self.communicator.local_id();
        let deadline = Instant::now() + timeout;
        let mut join_set: JoinSet<(PeerId, anyhow::Result<Vec<PeerDescriptor>>)> = JoinSet::new();
        let mut no_progress = 0usize;
        let mut timed_out = false;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                debug!(target = %self.target, "discovery session stopped externally");
                break;
            }
            if no_progress >= self.no_progress_limit {
                trace!(
                    target = %self.target,
                    no_progress,
                    "lookup made no progress, concluding"
                );
                break;
            }

            // Top the in-flight pool back up to `parallelism`. Dispatched
            // contacts are marked contacted immediately so the next pull
            // skips them.
            while join_set.len() < self.parallelism {
                let Some(next) = self.contact_list.get_uncontacted_contacts(1).pop() else {
                    break;
                };
                self.contact_list.set_contacted(&next.id);
                let peer = DhtPeer::new(next.clone(), self.communicator.clone());
                let target = self.target;
                trace!(target = %target, contact = %next.id, "dispatching getClosestPeers");
                join_set.spawn(async move { (peer.id(), peer.get_closest_peers(target).await) });
            }

            if join_set.is_empty() {
                // Uncontacted and in-flight both drained.
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            let joined = match tokio::time::timeout(remaining, join_set.join_next()).await {
                Ok(joined) => joined,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            };
            let Some(joined) = joined else { break };
            let Ok((peer_id, result)) = joined else {
                continue;
            };

            match result {
                Ok(contacts) => {
                    let closest_before = self.contact_list.get_closest_contact_id();
                    self.contact_list.set_active(&peer_id);
                    self.peer_store.set_active(&peer_id);
                    for contact in contacts {
                        if contact.id == own_id {
                            continue;
                        }
                        self.contact_list.add_contact(contact.clone());
                        self.peer_store.add_contact(contact);
                    }
                    // Progress means the closest known id changed. An empty
                    // list before the merge always counts as progress.
                    let closest_after = self.contact_list.get_closest_contact_id();
                    if closest_before.is_some() && closest_before == closest_after {
                        no_progress += 1;
                    } else {
                        no_progress = 0;
                    }
                }
                Err(err) => {
                    // Unreachable contact: bar it from the session for good
                    // (a later response must not re-admit it) and drop it
                    // from the node's neighbor state.
                    trace!(target = %self.target, contact = %peer_id, error = %err,
                        "getClosestPeers failed, excluding contact");
                    self.contact_list.exclude(peer_id);
                    self.peer_store.remove_contact(&peer_id);
                }
            }
        }

        if timed_out {
            debug!(
                target = %self.target,
                found = self.contact_list.len(),
                "discovery session hit wall-clock timeout"
            );
        }
        DiscoveryResult {
            closest: self.contact_list.get_all_contacts(),
            timed_out,
        }
    }
}

struct DiscoveryInner {
    local: PeerDescriptor,
    peer_store: PeerStore,
    communicator: RpcCommunicator,
    connections: ConnectionSet,
    config: DiscoveryConfig,
    /// Stop flags of sessions currently running, keyed by session id.
    sessions: Mutex<HashMap<RequestId, Arc<AtomicBool>>>,
    rejoin_ongoing: AtomicBool,
    refresh_started: AtomicBool,
    stopped: AtomicBool,
}

/// Owns the join/rejoin lifecycle and drives [`DiscoverySession`]s.
#[derive(Clone)]
pub struct PeerDiscovery {
    inner: Arc<DiscoveryInner>,
}

impl PeerDiscovery {
    pub fn new(
        local: PeerDescriptor,
        peer_store: PeerStore,
        communicator: RpcCommunicator,
        connections: ConnectionSet,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                local,
                peer_store,
                communicator,
                connections,
                config,
                sessions: Mutex::new(HashMap::new()),
                rejoin_ongoing: AtomicBool::new(false),
                refresh_started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Bootstrap into the overlay through `entry_point`.
    ///
    /// Runs the self-lookup and a random-id lookup concurrently; both must
    /// finish (or time out) before this resolves. On success with a
    /// non-empty routing table the periodic neighbor refresh starts; an
    /// empty table schedules a rejoin instead.
    pub async fn join(&self, entry_point: PeerDescriptor) -> Result<(), JoinError> {
        self.join_inner(entry_point, true).await
    }

    async fn join_inner(
        &self,
        entry_point: PeerDescriptor,
        schedule_recovery: bool,
    ) -> Result<(), JoinError> {
        if self.is_stopped() {
            return Err(JoinError::Stopped);
        }
        if entry_point.id == self.inner.local.id {
            return Ok(());
        }
        info!(entry_point = %entry_point.id, "joining dht");
        // Pin the entry-point connection for the duration of the join so
        // connection pruning cannot tear it down mid-lookup.
        self.inner.connections.lock_peer(&entry_point.id);
        self.inner.peer_store.add_contact(entry_point.clone());

        let own_target = self.inner.local.id;
        let random_target = PeerId::random();
        let (own_result, random_result) = tokio::join!(
            self.run_session(own_target, Some(entry_point.clone())),
            self.run_session(random_target, Some(entry_point.clone())),
        );

        self.inner.connections.unlock_peer(&entry_point.id);
        if self.is_stopped() {
            return Err(JoinError::Stopped);
        }

        if schedule_recovery {
            if self.inner.peer_store.neighbor_count() == 0 {
                warn!(entry_point = %entry_point.id, "routing table empty after join, scheduling rejoin");
                self.schedule_rejoin(entry_point, REJOIN_INITIAL_DELAY);
            } else {
                self.ensure_refresh_task();
            }
        }

        if own_result.timed_out || random_result.timed_out {
            return Err(JoinError::Timeout);
        }
        debug!(
            neighbors = self.inner.peer_store.neighbor_count(),
            "dht join completed"
        );
        Ok(())
    }

    /// Clear neighbor state and join again.
    ///
    /// Single-flight: a rejoin already in progress makes this a no-op. On
    /// failure, or when the join leaves the routing table empty, another
    /// rejoin is scheduled after a fixed backoff; the loop only ends when
    /// the node is stopped.
    pub async fn rejoin(&self, entry_point: PeerDescriptor) {
        if self.is_stopped() || self.inner.rejoin_ongoing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(entry_point = %entry_point.id, "rejoining dht");
        self.inner.peer_store.clear();
        let result = self.join_inner(entry_point.clone(), false).await;
        self.inner.rejoin_ongoing.store(false, Ordering::SeqCst);
        match result {
            Ok(()) if self.inner.peer_store.neighbor_count() > 0 => {
                info!("rejoined dht successfully");
                self.ensure_refresh_task();
            }
            Ok(()) | Err(JoinError::Timeout) => {
                if !self.is_stopped() {
                    warn!("rejoin left routing table empty, retrying");
                    self.schedule_rejoin(entry_point, REJOIN_RETRY_DELAY);
                }
            }
            Err(JoinError::Stopped) => {}
        }
    }

    fn schedule_rejoin(&self, entry_point: PeerDescriptor, delay: Duration) {
        let discovery = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if !discovery.is_stopped() {
                discovery.rejoin(entry_point).await;
            }
        });
    }

    /// Run one lookup toward `target`; used by join and by the node's
    /// public `discover` operation.
    pub async fn run_session(
        &self,
        target: PeerId,
        seed: Option<PeerDescriptor>,
    ) -> DiscoveryResult {
        let session_id = RequestId::random();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut session = DiscoverySession::new(
            target,
            &self.inner.config,
            self.inner.peer_store.clone(),
            self.inner.communicator.clone(),
            stop_flag.clone(),
        );
        if let Some(seed) = seed {
            session.seed(seed);
        }
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(session_id, stop_flag);
        let result = session
            .find_closest_nodes(self.inner.config.join_timeout)
            .await;
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(&session_id);
        result
    }

    /// Periodically pull fresh neighbors from the closest known peers.
    fn ensure_refresh_task(&self) {
        if self.inner.refresh_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let discovery = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(NEIGHBOR_REFRESH_INTERVAL).await;
                if discovery.is_stopped() {
                    break;
                }
                discovery.fetch_closest_neighbors().await;
            }
        });
    }

    async fn fetch_closest_neighbors(&self) {
        let own_id = self.inner.local.id;
        let neighbors = self
            .inner
            .peer_store
            .closest_to(&own_id, self.inner.config.parallelism);
        let mut join_set = JoinSet::new();
        for descriptor in neighbors {
            let peer = DhtPeer::new(descriptor, self.inner.communicator.clone());
            join_set.spawn(async move { peer.get_closest_peers(own_id).await });
        }
        while let Some(joined) = join_set.join_next().await {
            if let Ok(Ok(contacts)) = joined {
                for contact in contacts {
                    if contact.id != own_id {
                        self.inner.peer_store.add_contact(contact);
                    }
                }
            }
        }
    }

    /// Stop discovery: no further joins, rejoins, or refreshes; all
    /// running sessions conclude with their current results.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let sessions = self
            .inner
            .sessions
            .lock()
            .expect("session table lock poisoned");
        for flag in sessions.values() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DhtRequest, DhtResponse, RpcMethod};
    use crate::peer::PEER_ID_LENGTH;
    use crate::simulator::SimulatedNetwork;

    fn id(fill: u8) -> PeerId {
        PeerId::from_bytes([fill; PEER_ID_LENGTH])
    }

    fn descriptor(fill: u8) -> PeerDescriptor {
        PeerDescriptor::server(id(fill), vec![format!("10.0.0.{fill}:1")])
    }

    /// Register a getClosestPeers handler that serves a fixed contact set.
    fn serve_contacts(communicator: &RpcCommunicator, contacts: Vec<PeerDescriptor>) {
        communicator.register_method(RpcMethod::GetClosestPeers, move |_from, request| {
            let contacts = contacts.clone();
            async move {
                match request {
                    DhtRequest::GetClosestPeers { .. } => Ok(DhtResponse::Peers(contacts)),
                    _ => anyhow::bail!("wrong request"),
                }
            }
        });
    }

    #[tokio::test]
    async fn session_walks_toward_target() {
        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        let b = network.add_peer(descriptor(0x02));
        let c = network.add_peer(descriptor(0x0F));

        // B knows C; C knows nobody new.
        serve_contacts(&b, vec![descriptor(0x0F)]);
        serve_contacts(&c, vec![descriptor(0x02)]);

        let store = PeerStore::new(id(0x01), 20);
        store.add_contact(descriptor(0x02));
        let session = DiscoverySession::new(
            id(0x0F),
            &DiscoveryConfig::default(),
            store.clone(),
            a,
            Arc::new(AtomicBool::new(false)),
        );
        let result = session.find_closest_nodes(Duration::from_secs(5)).await;
        assert!(!result.timed_out);
        assert_eq!(result.closest.first().unwrap().id, id(0x0F));
        assert!(store.closest_to(&id(0x0F), 4).iter().any(|d| d.id == id(0x0F)));
    }

    #[tokio::test]
    async fn session_terminates_when_every_peer_fails() {
        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        // B and C exist as contacts but have no reachable transport entry.
        let store = PeerStore::new(id(0x01), 20);
        store.add_contact(descriptor(0x02));
        store.add_contact(descriptor(0x03));
        network.set_unreachable(id(0x02));
        network.set_unreachable(id(0x03));

        let session = DiscoverySession::new(
            id(0x0F),
            &DiscoveryConfig::default(),
            store.clone(),
            a,
            Arc::new(AtomicBool::new(false)),
        );
        let result = session.find_closest_nodes(Duration::from_secs(5)).await;
        // All contacts failed: the session drains and concludes with an
        // empty working list, and the failed peers are gone from the store.
        assert!(!result.timed_out);
        assert!(result.closest.is_empty());
        assert_eq!(store.neighbor_count(), 0);
    }

    #[tokio::test]
    async fn failed_contact_is_never_recontacted_within_a_session() {
        use std::sync::atomic::AtomicUsize;

        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        let b = network.add_peer(descriptor(0x02));
        let c = network.add_peer(descriptor(0x03));
        let d = network.add_peer(descriptor(0x04));

        // B introduces the dead peer D right away; C repeats the
        // introduction only after D has already failed once.
        serve_contacts(&b, vec![descriptor(0x04)]);
        c.register_method(RpcMethod::GetClosestPeers, move |_from, _request| async move {
            sleep(Duration::from_millis(100)).await;
            Ok(DhtResponse::Peers(vec![descriptor(0x04)]))
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_seen = calls.clone();
        d.register_method(RpcMethod::GetClosestPeers, move |_from, _request| {
            let calls = calls_seen.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("dead peer")
            }
        });

        let store = PeerStore::new(id(0x01), 20);
        store.add_contact(descriptor(0x02));
        store.add_contact(descriptor(0x03));
        let session = DiscoverySession::new(
            id(0x0F),
            &DiscoveryConfig::default(),
            store,
            a,
            Arc::new(AtomicBool::new(false)),
        );
        let result = session.find_closest_nodes(Duration::from_secs(5)).await;
        assert!(!result.timed_out);
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "a failed contact must stay excluded for the rest of the session"
        );
        assert!(result.closest.iter().all(|desc| desc.id != id(0x04)));
    }

    #[tokio::test]
    async fn empty_store_session_concludes_immediately() {
        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        let store = PeerStore::new(id(0x01), 20);
        let session = DiscoverySession::new(
            id(0x0F),
            &DiscoveryConfig::default(),
            store,
            a,
            Arc::new(AtomicBool::new(false)),
        );
        let result = session.find_closest_nodes(Duration::from_secs(5)).await;
        assert!(!result.timed_out);
        assert!(result.closest.is_empty());
    }

    #[tokio::test]
    async fn join_populates_store_and_seeds_through_entry_point() {
        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        let entry = network.add_peer(descriptor(0x02));
        let c = network.add_peer(descriptor(0x03));
        serve_contacts(&entry, vec![descriptor(0x03)]);
        serve_contacts(&c, vec![descriptor(0x02)]);

        let store = PeerStore::new(id(0x01), 20);
        let connections = ConnectionSet::new();
        connections.on_connected(descriptor(0x02));
        let discovery = PeerDiscovery::new(
            descriptor(0x01),
            store.clone(),
            a,
            connections,
            DiscoveryConfig {
                join_timeout: Duration::from_secs(5),
                ..DiscoveryConfig::default()
            },
        );
        discovery.join(descriptor(0x02)).await.unwrap();
        assert!(store.neighbor_count() >= 2);
        discovery.stop();
    }

    #[tokio::test]
    async fn join_to_self_is_a_no_op() {
        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        let store = PeerStore::new(id(0x01), 20);
        let discovery = PeerDiscovery::new(
            descriptor(0x01),
            store.clone(),
            a,
            ConnectionSet::new(),
            DiscoveryConfig::default(),
        );
        discovery.join(descriptor(0x01)).await.unwrap();
        assert_eq!(store.neighbor_count(), 0);
        discovery.stop();
    }

    #[tokio::test]
    async fn stopped_discovery_rejects_join() {
        let network = SimulatedNetwork::new();
        let a = network.add_peer(descriptor(0x01));
        let discovery = PeerDiscovery::new(
            descriptor(0x01),
            PeerStore::new(id(0x01), 20),
            a,
            ConnectionSet::new(),
            DiscoveryConfig::default(),
        );
        discovery.stop();
        assert_eq!(
            discovery.join(descriptor(0x02)).await,
            Err(JoinError::Stopped)
        );
    }
}
