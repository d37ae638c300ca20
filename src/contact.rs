//! # Contact Lists
//!
//! Bounded containers of remote-peer descriptors, ordered by XOR distance
//! or by insertion:
//!
//! | Type | Ordering | Eviction |
//! |------|----------|----------|
//! | [`SortedContactList`] | ascending distance to a reference id | farthest entry, only for a strictly closer insert |
//! | [`RandomContactList`] | insertion order | oldest entry |
//! | [`PeerStore`] | node-level neighbor + random lists | neighbor evictions feed the random list |
//!
//! `SortedContactList` is the working state of every discovery and routing
//! session and doubles as the k-bucket approximation for the node's own
//! neighbor set. All operations on absent ids are silent no-ops: sessions
//! race against concurrent removal and must tolerate stale references.
//!
//! Mutations return [`ContactEvent`] values instead of firing ambient
//! callbacks, so the caller decides what (if anything) observes a change.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::peer::{distance_cmp, PeerDescriptor, PeerId, PEER_ID_LENGTH};

/// Number of closest active contacts included in change-event snapshots.
const CLOSEST_SNAPSHOT_SIZE: usize = 8;

/// Change notification produced by contact-list mutations.
///
/// Each event carries a snapshot of the closest active contacts at the time
/// of the change, so observers never need to re-query the list.
#[derive(Clone, Debug)]
pub enum ContactEvent {
    NewContact {
        descriptor: PeerDescriptor,
        closest_active: Vec<PeerDescriptor>,
    },
    ContactRemoved {
        descriptor: PeerDescriptor,
        closest_active: Vec<PeerDescriptor>,
    },
}

/// A contact plus the per-list mutable state tracked for it.
///
/// `contacted` and `active` are scoped to the owning list: the same peer in
/// two lists has independent flags.
#[derive(Clone, Debug)]
pub struct ContactState {
    pub descriptor: PeerDescriptor,
    pub contacted: bool,
    pub active: bool,
    /// Insertion sequence assigned by the owning list, kept for diagnostics.
    seq: u64,
}

impl ContactState {
    fn new(descriptor: PeerDescriptor, seq: u64) -> Self {
        Self {
            descriptor,
            contacted: false,
            active: false,
            seq,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

/// Bounded contact list ordered by ascending XOR distance to a reference id.
///
/// Invariants:
/// - no duplicate ids, and the reference id itself is excluded unless
///   `allow_reference_id` is set (routing lists may contain their target)
/// - iteration yields non-decreasing distance to the reference id, with
///   equidistant ids ordered lexicographically by raw id bytes
/// - the list never exceeds `max_size`; at capacity an insert succeeds only
///   if strictly closer than the current farthest entry, which is evicted
pub struct SortedContactList {
    reference_id: PeerId,
    max_size: usize,
    allow_reference_id: bool,
    /// Contacts at or beyond this distance are rejected. Routing sessions
    /// set it to the previous hop's distance so messages never move
    /// backward along the path.
    distance_limit: Option<[u8; PEER_ID_LENGTH]>,
    excluded: HashSet<PeerId>,
    entries: Vec<ContactState>,
    next_seq: u64,
}

impl SortedContactList {
    pub fn new(reference_id: PeerId, max_size: usize) -> Self {
        Self {
            reference_id,
            max_size,
            allow_reference_id: false,
            distance_limit: None,
            excluded: HashSet::new(),
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    /// Allow the reference id itself to appear as a contact. Routing
    /// sessions measure distance to the message target, which may well be
    /// a reachable peer.
    pub fn with_reference_id_allowed(mut self) -> Self {
        self.allow_reference_id = true;
        self
    }

    /// Reject contacts at or farther than `limit_id`'s distance from the
    /// reference id.
    pub fn with_distance_limit(mut self, limit_id: PeerId) -> Self {
        self.distance_limit = Some(limit_id.xor_distance(&self.reference_id));
        self
    }

    /// Never admit the given ids (e.g. peers already on the routing path).
    pub fn with_excluded_ids(mut self, excluded: HashSet<PeerId>) -> Self {
        self.excluded = excluded;
        self
    }

    pub fn reference_id(&self) -> PeerId {
        self.reference_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position at which `id` belongs, or `Ok` index if already present.
    fn search(&self, id: &PeerId) -> Result<usize, usize> {
        let dist = id.xor_distance(&self.reference_id);
        self.entries.binary_search_by(|entry| {
            let entry_dist = entry.descriptor.id.xor_distance(&self.reference_id);
            distance_cmp(&entry_dist, &dist).then_with(|| entry.descriptor.id.cmp(id))
        })
    }

    /// Add a contact, returning the change events this produced.
    ///
    /// No-ops (empty result): the reference id itself, an excluded or
    /// already-present id, a contact beyond the distance limit, and a
    /// contact farther than the whole list when at capacity.
    pub fn add_contact(&mut self, descriptor: PeerDescriptor) -> Vec<ContactEvent> {
        let id = descriptor.id;
        if (!self.allow_reference_id && id == self.reference_id) || self.excluded.contains(&id) {
            return vec![];
        }
        let dist = id.xor_distance(&self.reference_id);
        if let Some(limit) = &self.distance_limit {
            if distance_cmp(&dist, limit) != std::cmp::Ordering::Less {
                return vec![];
            }
        }
        let index = match self.search(&id) {
            Ok(_) => return vec![],
            Err(index) => index,
        };

        let mut events = Vec::new();
        if self.entries.len() >= self.max_size {
            // Full: admit only a strictly closer contact, dropping the
            // current farthest.
            if index >= self.entries.len() {
                return vec![];
            }
            let evicted = self.entries.pop().map(|e| e.descriptor);
            if let Some(evicted) = evicted {
                trace!(
                    evicted = %evicted.id,
                    added = %id,
                    "contact list full, evicting farthest entry"
                );
                events.push(ContactEvent::ContactRemoved {
                    descriptor: evicted,
                    closest_active: self.closest_active_snapshot(),
                });
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(index, ContactState::new(descriptor.clone(), seq));
        events.push(ContactEvent::NewContact {
            descriptor,
            closest_active: self.closest_active_snapshot(),
        });
        events
    }

    /// Add several contacts, preserving arrival order.
    pub fn add_contacts(&mut self, descriptors: Vec<PeerDescriptor>) -> Vec<ContactEvent> {
        let mut events = Vec::new();
        for descriptor in descriptors {
            events.extend(self.add_contact(descriptor));
        }
        events
    }

    /// Mark a contact as contacted. Silent no-op if absent.
    pub fn set_contacted(&mut self, id: &PeerId) {
        if let Ok(index) = self.search(id) {
            self.entries[index].contacted = true;
        }
    }

    /// Mark a contact as active (it has responded). Silent no-op if absent.
    pub fn set_active(&mut self, id: &PeerId) {
        if let Ok(index) = self.search(id) {
            self.entries[index].active = true;
        }
    }

    pub fn is_active(&self, id: &PeerId) -> bool {
        matches!(self.search(id), Ok(index) if self.entries[index].active)
    }

    pub fn has_contact(&self, id: &PeerId) -> bool {
        self.search(id).is_ok()
    }

    /// Up to `limit` uncontacted contacts in ascending-distance order.
    pub fn get_uncontacted_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.entries
            .iter()
            .filter(|e| !e.contacted)
            .take(limit)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn uncontacted_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.contacted).count()
    }

    /// Ascending-distance prefix of size `limit`.
    pub fn get_closest_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.entries
            .iter()
            .take(limit)
            .map(|e| e.descriptor.clone())
            .collect()
    }

    pub fn get_all_contacts(&self) -> Vec<PeerDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn contact_ids(&self) -> Vec<PeerId> {
        self.entries.iter().map(|e| e.descriptor.id).collect()
    }

    /// The nearest id, or `None` for an empty list. Callers comparing
    /// lookup progress must check emptiness rather than assume a value.
    pub fn get_closest_contact_id(&self) -> Option<PeerId> {
        self.entries.first().map(|e| e.descriptor.id)
    }

    /// Remove a contact, reporting whether it was present.
    pub fn remove_contact(&mut self, id: &PeerId) -> (bool, Option<ContactEvent>) {
        match self.search(id) {
            Ok(index) => {
                let removed = self.entries.remove(index);
                let event = ContactEvent::ContactRemoved {
                    descriptor: removed.descriptor,
                    closest_active: self.closest_active_snapshot(),
                };
                (true, Some(event))
            }
            Err(_) => (false, None),
        }
    }

    /// Permanently bar an id from the list, dropping it if present.
    ///
    /// Lookup sessions exclude a failed peer so a later response naming the
    /// same peer cannot re-admit it.
    pub fn exclude(&mut self, id: PeerId) -> (bool, Option<ContactEvent>) {
        let removed = self.remove_contact(&id);
        self.excluded.insert(id);
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn closest_active_snapshot(&self) -> Vec<PeerDescriptor> {
        self.entries
            .iter()
            .filter(|e| e.active)
            .take(CLOSEST_SNAPSHOT_SIZE)
            .map(|e| e.descriptor.clone())
            .collect()
    }
}

/// Bounded insertion-ordered contact list with no distance ordering.
///
/// Maintains a diversity sample independent of proximity: duplicates are
/// rejected by id and overflow evicts the oldest entry.
pub struct RandomContactList {
    own_id: PeerId,
    max_size: usize,
    entries: VecDeque<PeerDescriptor>,
}

impl RandomContactList {
    pub fn new(own_id: PeerId, max_size: usize) -> Self {
        Self {
            own_id,
            max_size,
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_contact(&self, id: &PeerId) -> bool {
        self.entries.iter().any(|d| d.id == *id)
    }

    /// Add a contact; duplicates and the own id are silently rejected.
    /// Returns the descriptor evicted to make room, if any.
    pub fn add_contact(&mut self, descriptor: PeerDescriptor) -> Option<PeerDescriptor> {
        if descriptor.id == self.own_id || self.has_contact(&descriptor.id) {
            return None;
        }
        let evicted = if self.entries.len() >= self.max_size {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(descriptor);
        evicted
    }

    pub fn remove_contact(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.entries.iter().position(|d| d.id == *id) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn get_contacts(&self, limit: usize) -> Vec<PeerDescriptor> {
        self.entries.iter().take(limit).cloned().collect()
    }
}

struct PeerStoreInner {
    neighbors: SortedContactList,
    random: RandomContactList,
}

/// Node-level contact state: the neighbor list (k-bucket approximation)
/// plus a random diversity sample.
///
/// Shared between discovery and routing via cheap clones; mutations are
/// serialized behind one lock so interleaved async continuations never see
/// a partial update.
#[derive(Clone)]
pub struct PeerStore {
    own_id: PeerId,
    inner: Arc<Mutex<PeerStoreInner>>,
}

impl PeerStore {
    pub fn new(own_id: PeerId, max_neighbors: usize) -> Self {
        Self {
            own_id,
            inner: Arc::new(Mutex::new(PeerStoreInner {
                neighbors: SortedContactList::new(own_id, max_neighbors),
                random: RandomContactList::new(own_id, max_neighbors),
            })),
        }
    }

    pub fn own_id(&self) -> PeerId {
        self.own_id
    }

    /// Register a contact. Neighbors evicted by a closer insert are demoted
    /// into the random sample rather than forgotten.
    pub fn add_contact(&self, descriptor: PeerDescriptor) -> Vec<ContactEvent> {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        let events = inner.neighbors.add_contact(descriptor);
        for event in &events {
            if let ContactEvent::ContactRemoved { descriptor, .. } = event {
                inner.random.add_contact(descriptor.clone());
            }
        }
        events
    }

    pub fn add_contacts(&self, descriptors: Vec<PeerDescriptor>) -> Vec<ContactEvent> {
        let mut events = Vec::new();
        for descriptor in descriptors {
            events.extend(self.add_contact(descriptor));
        }
        events
    }

    pub fn set_active(&self, id: &PeerId) {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        inner.neighbors.set_active(id);
    }

    pub fn remove_contact(&self, id: &PeerId) -> bool {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        let (removed, _) = inner.neighbors.remove_contact(id);
        inner.random.remove_contact(id) || removed
    }

    /// Closest known contacts to `target`, merged from the neighbor list
    /// and the random sample.
    pub fn closest_to(&self, target: &PeerId, limit: usize) -> Vec<PeerDescriptor> {
        let inner = self.inner.lock().expect("peer store lock poisoned");
        let mut merged =
            SortedContactList::new(*target, usize::MAX).with_reference_id_allowed();
        for descriptor in inner.neighbors.get_all_contacts() {
            if descriptor.id != self.own_id {
                merged.add_contact(descriptor);
            }
        }
        for descriptor in inner.random.get_contacts(usize::MAX) {
            if descriptor.id != self.own_id {
                merged.add_contact(descriptor);
            }
        }
        merged.get_closest_contacts(limit)
    }

    pub fn neighbor_count(&self) -> usize {
        self.inner.lock().expect("peer store lock poisoned").neighbors.len()
    }

    /// Drop all contact state. Used when rejoining the network.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("peer store lock poisoned");
        inner.neighbors.clear();
        let ids: Vec<PeerId> = inner.random.get_contacts(usize::MAX).iter().map(|d| d.id).collect();
        for id in ids {
            inner.random.remove_contact(&id);
        }
    }
}

struct ConnectionEntry {
    descriptor: PeerDescriptor,
    /// Pin count; pinned connections survive pruning (e.g. the join entry
    /// point while discovery is running against it).
    locks: usize,
}

/// Registry of currently live connections.
///
/// The external connection manager owns connect/disconnect decisions and
/// mutates this set via [`DhtNode::handle_connected`]/[`handle_disconnected`]
/// (`crate::node`); discovery and routing only read it.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<Mutex<std::collections::HashMap<PeerId, ConnectionEntry>>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&self, descriptor: PeerDescriptor) {
        let mut inner = self.inner.lock().expect("connection set lock poisoned");
        inner
            .entry(descriptor.id)
            .or_insert(ConnectionEntry {
                descriptor,
                locks: 0,
            });
    }

    /// Remove a connection unless it is pinned.
    /// Returns whether the entry was removed.
    pub fn on_disconnected(&self, id: &PeerId) -> bool {
        let mut inner = self.inner.lock().expect("connection set lock poisoned");
        match inner.get(id) {
            Some(entry) if entry.locks == 0 => {
                inner.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Pin a connection so pruning cannot drop it.
    pub fn lock_peer(&self, id: &PeerId) {
        let mut inner = self.inner.lock().expect("connection set lock poisoned");
        if let Some(entry) = inner.get_mut(id) {
            entry.locks += 1;
        }
    }

    pub fn unlock_peer(&self, id: &PeerId) {
        let mut inner = self.inner.lock().expect("connection set lock poisoned");
        if let Some(entry) = inner.get_mut(id) {
            entry.locks = entry.locks.saturating_sub(1);
        }
    }

    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.inner
            .lock()
            .expect("connection set lock poisoned")
            .contains_key(id)
    }

    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.inner
            .lock()
            .expect("connection set lock poisoned")
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("connection set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
