//! Per-peer sync state.
//!
//! A [`PeerState`] records what a peer is known to have (acknowledged),
//! what it is assumed to have (optimistic: sent but not acknowledged yet),
//! which CoValues it was told about or asked for, and the outgoing queue.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use covalue_core::{CoValueId, KnownState, PeerId, Priority};

use crate::messages::SyncMessage;

/// What a peer is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Asked for loads and receives every push.
    Server,
    /// Receives pushes for CoValues it has shown interest in.
    Client,
}

/// Outgoing messages in three priority lanes, FIFO within a lane.
#[derive(Debug, Default)]
struct Outbox {
    high: VecDeque<SyncMessage>,
    medium: VecDeque<SyncMessage>,
    low: VecDeque<SyncMessage>,
}

impl Outbox {
    fn push(&mut self, message: SyncMessage) {
        match message.priority() {
            Priority::High => self.high.push_back(message),
            Priority::Medium => self.medium.push_back(message),
            Priority::Low => self.low.push_back(message),
        }
    }

    fn pop(&mut self) -> Option<SyncMessage> {
        self.high
            .pop_front()
            .or_else(|| self.medium.pop_front())
            .or_else(|| self.low.pop_front())
    }

    fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    fn drain(&mut self) -> Vec<SyncMessage> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(message) = self.pop() {
            out.push(message);
        }
        out
    }
}

/// Sync state for one connected peer.
#[derive(Debug)]
pub struct PeerState {
    id: PeerId,
    role: PeerRole,
    persistent: bool,
    known: HashMap<CoValueId, KnownState>,
    optimistic: HashMap<CoValueId, KnownState>,
    told: HashSet<CoValueId>,
    requested: HashSet<CoValueId>,
    errored: HashSet<CoValueId>,
    outbox: Outbox,
    closed: bool,
}

impl PeerState {
    pub fn new(id: PeerId, role: PeerRole, persistent: bool) -> Self {
        Self {
            id,
            role,
            persistent,
            known: HashMap::new(),
            optimistic: HashMap::new(),
            told: HashSet::new(),
            requested: HashSet::new(),
            errored: HashSet::new(),
            outbox: Outbox::default(),
            closed: false,
        }
    }

    /// Fresh state for a reconnect of the same peer.
    ///
    /// A persistent peer keeps its acknowledged known states; everything
    /// else starts over.
    pub fn reconnected(&self, role: PeerRole) -> Self {
        let mut next = Self::new(self.id.clone(), role, self.persistent);
        if self.persistent {
            next.known = self.known.clone();
        }
        next
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn is_server(&self) -> bool {
        self.role == PeerRole::Server
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    // ------------------------------------------------------------------------
    // Known state
    // ------------------------------------------------------------------------

    /// Acknowledged known state.
    pub fn known_state(&self, id: &CoValueId) -> Option<&KnownState> {
        self.known.get(id)
    }

    /// What we assume the peer has: optimistic if set, else acknowledged.
    pub fn optimistic_known_state(&self, id: &CoValueId) -> Option<&KnownState> {
        self.optimistic.get(id).or_else(|| self.known.get(id))
    }

    /// Replace the known state verbatim and drop the optimistic cache.
    pub fn set_known_state(&mut self, known: KnownState) {
        self.optimistic.remove(&known.id);
        self.known.insert(known.id, known);
    }

    /// Merge an acknowledgement, max-wise per session.
    pub fn combine_known_state(&mut self, known: &KnownState) {
        self.known
            .entry(known.id)
            .or_insert_with(|| KnownState::empty(known.id))
            .combine_with(known);
        if let Some(optimistic) = self.optimistic.get_mut(&known.id) {
            optimistic.combine_with(known);
        }
    }

    /// Record content as sent.
    pub fn combine_optimistic(&mut self, known: &KnownState) {
        let base = self.known.get(&known.id).cloned();
        self.optimistic
            .entry(known.id)
            .or_insert_with(|| base.unwrap_or_else(|| KnownState::empty(known.id)))
            .combine_with(known);
    }

    /// True once the peer has shown interest in `id`.
    pub fn is_interested(&self, id: &CoValueId) -> bool {
        self.known.contains_key(id) || self.requested.contains(id)
    }

    pub fn mark_told(&mut self, id: CoValueId) {
        self.told.insert(id);
    }

    pub fn was_told(&self, id: &CoValueId) -> bool {
        self.told.contains(id)
    }

    pub fn mark_requested(&mut self, id: CoValueId) {
        self.requested.insert(id);
    }

    pub fn was_requested(&self, id: &CoValueId) -> bool {
        self.requested.contains(id)
    }

    /// Skip this peer for `id` from now on.
    pub fn mark_errored(&mut self, id: CoValueId) {
        self.errored.insert(id);
    }

    pub fn is_errored(&self, id: &CoValueId) -> bool {
        self.errored.contains(id)
    }

    // ------------------------------------------------------------------------
    // Outgoing queue
    // ------------------------------------------------------------------------

    /// Queue a message. Dropped once the peer is shut down.
    pub fn push(&mut self, message: SyncMessage) {
        if self.closed {
            trace!(peer = %self.id, action = message.action(), id = %message.id(), "dropping message for closed peer");
            return;
        }
        self.outbox.push(message);
    }

    /// Next message by lane priority.
    pub fn pop(&mut self) -> Option<SyncMessage> {
        self.outbox.pop()
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Close the queue and hand back what was still waiting.
    pub fn shutdown(&mut self) -> Vec<SyncMessage> {
        self.closed = true;
        self.outbox.drain()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
