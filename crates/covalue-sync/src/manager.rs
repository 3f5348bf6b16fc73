//! Sync manager: the symmetric message handler.
//!
//! The manager is a synchronous state machine. Callers feed it messages with
//! [`SyncManager::handle_message`], advance its timers with
//! [`SyncManager::tick`], and collect what it wants to send with
//! [`SyncManager::take_outgoing`]. It never performs network I/O itself;
//! storage is called in place.
//!
//! # Protocol
//!
//! ```text
//! Loader                          Holder
//!   |                               |
//!   |-------- load(known) --------->|  holder records loader's state verbatim
//!   |<------- known(holder) --------|
//!   |<------- content(diff) --------|  one or more pieces, dependencies first
//!   |-------- known(ack) ---------->|
//! ```
//!
//! A content piece that does not continue the receiver's log is answered
//! with a correction (`known` with `isCorrection`) carrying the receiver's
//! true state, and nothing from it is applied.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use covalue_core::{
    AggregateState, CoValueCore, CoValueId, CoValueRegistry, ContentPiece, KnownState,
    LoadSource, LoadingStatus, PeerId,
};
use covalue_store::{Storage, StoreOutcome};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::messages::{KnownMessage, LoadMessage, SyncMessage};
use crate::peer::{PeerRole, PeerState};
use crate::selection::select_peers;

/// An unanswered load request to one peer.
#[derive(Debug, Clone, Copy)]
struct PendingLoad {
    deadline: Instant,
    /// Load messages sent so far.
    attempt: u32,
}

/// Counters over the lifetime of a manager.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Messages handled.
    pub received: usize,
    /// Transactions appended from content messages.
    pub applied: usize,
    /// Session slices rejected for a bad hash or signature.
    pub rejected: usize,
    /// Corrections sent for content that did not continue our log.
    pub corrections_sent: usize,
    /// Load requests that timed out for good.
    pub timeouts: usize,
}

/// Node-wide sync state over all peers.
pub struct SyncManager {
    registry: CoValueRegistry,
    peers: BTreeMap<PeerId, PeerState>,
    /// Persistent peers kept across a disconnect.
    disconnected: HashMap<PeerId, PeerState>,
    storage: Option<Arc<dyn Storage>>,
    config: SyncConfig,
    pending_loads: HashMap<(CoValueId, PeerId), PendingLoad>,
    /// Content waiting on an account, keyed by the account.
    parked: HashMap<CoValueId, Vec<(LoadSource, ContentPiece)>>,
    /// CoValues this node asked to load.
    wanted: BTreeSet<CoValueId>,
    /// Peers that sent a load we could not answer yet.
    waiting: HashMap<CoValueId, BTreeSet<PeerId>>,
    stats: SyncStats,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("registry", &self.registry)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .field("storage", &self.storage.is_some())
            .field("pending_loads", &self.pending_loads.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new(CoValueRegistry::default(), SyncConfig::default())
    }
}

impl AsMut<SyncManager> for SyncManager {
    fn as_mut(&mut self) -> &mut SyncManager {
        self
    }
}

impl SyncManager {
    /// Create a manager around `registry`, applying the log settings of `config`.
    pub fn new(registry: CoValueRegistry, config: SyncConfig) -> Self {
        Self {
            registry: registry.with_log_config(config.log),
            peers: BTreeMap::new(),
            disconnected: HashMap::new(),
            storage: None,
            config,
            pending_loads: HashMap::new(),
            parked: HashMap::new(),
            wanted: BTreeSet::new(),
            waiting: HashMap::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn registry(&self) -> &CoValueRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CoValueRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn peer(&self, id: &PeerId) -> Option<&PeerState> {
        self.peers.get(id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    /// Loads still waiting for an answer.
    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.len()
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Connect a peer. Server peers are reconciled at once.
    pub fn add_peer(&mut self, id: PeerId, role: PeerRole, persistent: bool) {
        let state = match self.disconnected.remove(&id) {
            Some(previous) => previous.reconnected(role),
            None => PeerState::new(id.clone(), role, persistent),
        };
        debug!(peer = %id, ?role, persistent, "peer connected");
        self.peers.insert(id.clone(), state);

        // Loads left running across a disconnect start over with a fresh timer.
        let mut interrupted: Vec<CoValueId> = self
            .pending_loads
            .keys()
            .filter(|(_, p)| *p == id)
            .map(|(covalue, _)| *covalue)
            .collect();
        interrupted.sort_unstable();
        for covalue in &interrupted {
            self.pending_loads.remove(&(*covalue, id.clone()));
        }

        if role == PeerRole::Server {
            self.reconcile(&id);
        }
        for covalue in interrupted {
            if !self.registry.is_available(&covalue) {
                self.request_from_peer(covalue, &id);
            }
        }
    }

    /// Disconnect a peer, returning the messages it never got.
    pub fn remove_peer(&mut self, id: &PeerId) -> Vec<SyncMessage> {
        let Some(mut peer) = self.peers.remove(id) else {
            return Vec::new();
        };
        let dropped = peer.shutdown();
        debug!(peer = %id, dropped = dropped.len(), "peer disconnected");

        // A persistent peer keeps its loads pending: they settle when the
        // timer runs out or are asked again on reconnect.
        if !peer.is_persistent() {
            let pending: Vec<CoValueId> = self
                .pending_loads
                .keys()
                .filter(|(_, p)| p == id)
                .map(|(covalue, _)| *covalue)
                .collect();
            let source = LoadSource::Peer(id.clone());
            for covalue in pending {
                self.pending_loads.remove(&(covalue, id.clone()));
                self.registry
                    .entry(covalue)
                    .set_loading_status(source.clone(), LoadingStatus::Unavailable);
                self.answer_waiting_if_settled(covalue);
            }
        }
        for waiters in self.waiting.values_mut() {
            waiters.remove(id);
        }

        if peer.is_persistent() {
            self.disconnected.insert(id.clone(), peer);
        }
        dropped
    }

    /// Tell a freshly connected server what we have and ask for what we want.
    fn reconcile(&mut self, peer: &PeerId) {
        for id in self.dependency_order() {
            if self.registry.is_available(&id) {
                let known = self.registry.entry(id).known_state();
                if let Some(state) = self.peers.get_mut(peer) {
                    state.push(SyncMessage::Load(LoadMessage::from(&known)));
                    state.mark_told(id);
                }
            } else if self.wanted.contains(&id) {
                self.request_from_peer(id, peer);
            }
        }
    }

    /// Every local CoValue, dependencies before dependants.
    fn dependency_order(&self) -> Vec<CoValueId> {
        let mut roots: Vec<CoValueId> = self.registry.ids().copied().collect();
        roots.sort();

        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(roots.len());
        for root in roots {
            if !visited.insert(root) {
                continue;
            }
            let mut stack = vec![(root, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    order.push(id);
                    continue;
                }
                stack.push((id, true));
                if let Some(core) = self.registry.get(&id) {
                    for dependency in core.dependencies() {
                        if visited.insert(*dependency) {
                            stack.push((*dependency, false));
                        }
                    }
                }
            }
        }
        order
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Start loading `id`: storage first, then server peers.
    pub fn load(&mut self, id: CoValueId) -> AggregateState {
        self.wanted.insert(id);
        self.load_excluding(id, None)
    }

    fn load_excluding(&mut self, id: CoValueId, except: Option<&PeerId>) -> AggregateState {
        self.registry.entry(id);
        if !self.registry.is_available(&id) {
            self.load_from_storage(id);
        }
        if !self.registry.is_available(&id) {
            self.request_from_servers(id, except);
        }
        self.process_became_available();
        self.aggregate_state(&id)
    }

    pub fn aggregate_state(&self, id: &CoValueId) -> AggregateState {
        self.registry
            .get(id)
            .map_or(AggregateState::Unknown, CoValueCore::aggregate_state)
    }

    /// Replay stored content of `id`. Returns true if anything was found.
    fn load_from_storage(&mut self, id: CoValueId) -> bool {
        let Some(storage) = self.storage.clone() else {
            return false;
        };
        self.registry
            .entry(id)
            .set_loading_status(LoadSource::Storage, LoadingStatus::Pending);

        let mut pieces = Vec::new();
        match storage.load(&id, &mut |piece| pieces.push(piece)) {
            Ok(true) => {
                trace!(id = %id, pieces = pieces.len(), "loaded from storage");
                for piece in pieces {
                    self.apply_content(LoadSource::Storage, piece);
                }
                true
            }
            Ok(false) => {
                self.registry
                    .entry(id)
                    .set_loading_status(LoadSource::Storage, LoadingStatus::Unavailable);
                false
            }
            Err(e) => {
                warn!(id = %id, error = %e, "storage load failed");
                self.registry
                    .entry(id)
                    .set_loading_status(LoadSource::Storage, LoadingStatus::Errored(e.to_string()));
                false
            }
        }
    }

    fn request_from_servers(&mut self, id: CoValueId, except: Option<&PeerId>) {
        let candidates: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_server() && !p.is_errored(&id) && Some(p.id()) != except)
            .map(|p| p.id().clone())
            .collect();
        let selected = match self.config.max_server_peers {
            Some(n) => select_peers(&id, &candidates, n),
            None => candidates,
        };
        for peer in selected {
            self.request_from_peer(id, &peer);
        }
    }

    fn request_from_peer(&mut self, id: CoValueId, peer: &PeerId) {
        let key = (id, peer.clone());
        if self.pending_loads.contains_key(&key) {
            return;
        }
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        let core = self.registry.entry(id);
        state.push(SyncMessage::Load(LoadMessage::from(&core.known_state())));
        core.set_loading_status(LoadSource::Peer(peer.clone()), LoadingStatus::Pending);
        trace!(id = %id, peer = %peer, "load requested");
        self.pending_loads.insert(
            key,
            PendingLoad {
                deadline: Instant::now() + self.config.load_timeout,
                attempt: 1,
            },
        );
    }

    /// Load a dependency we discovered, unless it is already on its way.
    fn load_dependency(&mut self, id: CoValueId) {
        self.wanted.insert(id);
        if self.registry.is_available(&id) || self.aggregate_state(&id) == AggregateState::Loading {
            return;
        }
        self.load_excluding(id, None);
    }

    /// Expire load timers, retrying with backoff until attempts run out.
    pub fn tick(&mut self, now: Instant) {
        let mut expired: Vec<(CoValueId, PeerId)> = self
            .pending_loads
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort();

        for key in expired {
            let Some(pending) = self.pending_loads.remove(&key) else {
                continue;
            };
            let (id, peer) = key;
            if self.registry.is_available(&id) {
                continue;
            }

            let retry = &self.config.retry;
            if pending.attempt < retry.max_attempts && self.peers.contains_key(&peer) {
                let attempt = pending.attempt + 1;
                let deadline = now + retry.delay_for(pending.attempt);
                debug!(id = %id, peer = %peer, attempt, "retrying load");
                let known = self.registry.entry(id).known_state();
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.push(SyncMessage::Load(LoadMessage::from(&known)));
                }
                self.pending_loads
                    .insert((id, peer), PendingLoad { deadline, attempt });
            } else {
                warn!(id = %id, peer = %peer, attempts = pending.attempt, "load timed out");
                self.stats.timeouts += 1;
                self.registry
                    .entry(id)
                    .set_loading_status(LoadSource::Peer(peer), LoadingStatus::Unavailable);
                self.answer_waiting_if_settled(id);
            }
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    /// Handle one message from a connected peer.
    pub fn handle_message(&mut self, from: &PeerId, message: SyncMessage) -> Result<()> {
        if !self.peers.contains_key(from) {
            return Err(SyncError::PeerNotConnected(from.to_string()));
        }
        self.stats.received += 1;
        trace!(peer = %from, action = message.action(), id = %message.id(), "received");

        match message {
            SyncMessage::Load(load) => self.handle_load(from, load),
            SyncMessage::Known(known) => self.handle_known(from, known),
            SyncMessage::Content(piece) => self.apply_content(LoadSource::Peer(from.clone()), piece),
            SyncMessage::Done(done) => trace!(peer = %from, id = %done.id, "done"),
        }
        self.process_became_available();
        Ok(())
    }

    fn handle_load(&mut self, from: &PeerId, load: LoadMessage) {
        let id = load.id;
        let theirs = load.known_state();
        if let Some(peer) = self.peers.get_mut(from) {
            peer.set_known_state(theirs.clone());
            peer.mark_requested(id);
        }

        if self.registry.is_available(&id) {
            self.send_known_and_content(from, id);
            return;
        }

        if theirs.header {
            // They have it and we don't: pull it from them.
            self.registry.entry(id);
            self.request_from_peer(id, from);
            return;
        }

        if self.load_excluding(id, Some(from)) == AggregateState::Available {
            self.send_known_and_content(from, id);
        } else if self.aggregate_state(&id) == AggregateState::Loading {
            self.waiting.entry(id).or_default().insert(from.clone());
        } else {
            self.send_known(from, id);
        }
    }

    fn handle_known(&mut self, from: &PeerId, known: KnownMessage) {
        let id = known.id;
        let theirs = known.known_state();
        if let Some(peer) = self.peers.get_mut(from) {
            if known.is_correction {
                debug!(id = %id, peer = %from, "correction received");
                peer.set_known_state(theirs.clone());
            } else {
                peer.combine_known_state(&theirs);
            }
        }

        if !theirs.header && !self.registry.is_available(&id) {
            let source = LoadSource::Peer(from.clone());
            if self.pending_loads.remove(&(id, from.clone())).is_some()
                || self.registry.entry(id).loading_status(&source) == LoadingStatus::Pending
            {
                debug!(id = %id, peer = %from, "not found at peer");
                self.registry
                    .entry(id)
                    .set_loading_status(source, LoadingStatus::Unavailable);
                self.answer_waiting_if_settled(id);
            }
        }

        if self.registry.is_available(&id) {
            self.send_new_content(from, id);
        }
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Apply a content piece from a peer or from storage.
    fn apply_content(&mut self, source: LoadSource, piece: ContentPiece) {
        let id = piece.id;
        let from = match &source {
            LoadSource::Peer(peer) => Some(peer.clone()),
            LoadSource::Storage => None,
        };
        if let Some(peer) = &from {
            if self.peers.get(peer).is_some_and(|p| p.is_errored(&id)) {
                trace!(id = %id, peer = %peer, "ignoring content from errored peer");
                return;
            }
        }
        let trusted = source == LoadSource::Storage;
        let verify = !trusted && self.config.verify_content;

        if !self.registry.is_available(&id) {
            let Some(header) = piece.header.clone() else {
                self.on_missing_header(source, piece);
                return;
            };
            if let Err(e) = self.registry.provide_header(
                id,
                header,
                piece.expect_content_until.as_ref(),
                trusted,
            ) {
                warn!(id = %id, source = %source, error = %e, "rejected header");
                self.mark_errored(&source, id, e.to_string());
                return;
            }
            let missing: Vec<CoValueId> = self
                .registry
                .get(&id)
                .map(|core| core.missing_dependencies().iter().copied().collect())
                .unwrap_or_default();
            for dependency in missing {
                self.load_dependency(dependency);
            }
        }

        if verify {
            let mut accounts: Vec<CoValueId> = piece
                .new
                .keys()
                .filter_map(|session| session.author().account().copied())
                .filter(|account| *account != id && !self.registry.is_available(account))
                .collect();
            accounts.sort_unstable();
            accounts.dedup();
            for account in &accounts {
                self.registry.add_dependency(id, *account);
                self.load_dependency(*account);
            }
            if let Some(account) = accounts
                .into_iter()
                .find(|account| !self.registry.is_available(account))
            {
                if self.aggregate_state(&account) == AggregateState::Loading {
                    debug!(id = %id, account = %account, "content parked until account is available");
                    self.parked.entry(account).or_default().push((source, piece));
                } else {
                    debug!(id = %id, account = %account, "account not found, content dropped");
                    if let Some(peer) = &from {
                        self.send_ack(peer, id);
                    }
                }
                return;
            }
        }

        let ours = self.registry.entry(id).known_state();
        if piece.new.iter().any(|(session, c)| c.after > ours.count(session)) {
            match &from {
                Some(peer) => {
                    debug!(id = %id, peer = %peer, "content does not continue our log, correcting");
                    self.stats.corrections_sent += 1;
                    if let Some(state) = self.peers.get_mut(peer) {
                        state.push(SyncMessage::Known(KnownMessage::correction(&ours)));
                    }
                }
                None => error!(id = %id, "stored content does not continue the loaded log"),
            }
            return;
        }

        if let Some(until) = &piece.expect_content_until {
            self.registry.expect_content_until(&id, until);
        }

        let mut applied = 0usize;
        let mut failure = None;
        for (session, content) in &piece.new {
            let have = self
                .registry
                .verified(&id)
                .map_or(0, |state| state.transaction_count(session));
            if content.end() <= have {
                continue;
            }
            let slice = &content.new_transactions[(have - content.after) as usize..];
            match self.registry.try_add_transactions(
                &id,
                *session,
                slice,
                None,
                content.last_signature,
                !verify,
            ) {
                Ok(()) => {
                    applied += slice.len();
                    if self.registry.get(&id).is_some_and(CoValueCore::is_streaming) {
                        self.registry.record_checkpoint(
                            &id,
                            session,
                            content.end() - 1,
                            content.last_signature,
                        );
                    }
                }
                Err(e) if e.is_deferred() => {
                    debug!(id = %id, session = %session, error = %e, "session deferred");
                }
                Err(e) => {
                    warn!(id = %id, source = %source, session = %session, error = %e, "rejected transactions");
                    self.stats.rejected += 1;
                    failure = Some(e.to_string());
                }
            }
        }
        self.stats.applied += applied;

        match failure {
            Some(reason) => self.mark_errored(&source, id, reason),
            None => {
                self.registry
                    .entry(id)
                    .set_loading_status(source.clone(), LoadingStatus::Available);
                if let Some(peer) = &from {
                    self.pending_loads.remove(&(id, peer.clone()));
                }
            }
        }

        if let Some(peer) = &from {
            let mut sent = KnownState::empty(id);
            sent.header = true;
            for (session, content) in &piece.new {
                sent.raise(*session, content.end());
            }
            self.send_ack(peer, id);
            if let Some(state) = self.peers.get_mut(peer) {
                state.combine_known_state(&sent);
            }
            if applied > 0 || piece.header.is_some() {
                self.persist(id);
                self.broadcast(id, Some(peer));
            }
        }
        self.process_became_available();
    }

    fn on_missing_header(&mut self, source: LoadSource, piece: ContentPiece) {
        let id = piece.id;
        match source {
            LoadSource::Peer(peer) => {
                if self.load_from_storage(id) && self.registry.is_available(&id) {
                    self.apply_content(LoadSource::Peer(peer), piece);
                    return;
                }
                debug!(id = %id, peer = %peer, "content without header for unknown CoValue");
                self.stats.corrections_sent += 1;
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.push(SyncMessage::Known(KnownMessage::correction(&KnownState::empty(id))));
                }
            }
            LoadSource::Storage => {
                error!(id = %id, "stored content without header");
            }
        }
    }

    fn mark_errored(&mut self, source: &LoadSource, id: CoValueId, reason: String) {
        self.registry
            .entry(id)
            .set_loading_status(source.clone(), LoadingStatus::Errored(reason));
        if let LoadSource::Peer(peer) = source {
            if let Some(state) = self.peers.get_mut(peer) {
                state.mark_errored(id);
            }
            self.pending_loads.remove(&(id, peer.clone()));
        }
        self.answer_waiting_if_settled(id);
    }

    /// Cancel timers, answer waiters and unpark content for CoValues that just gained a header.
    fn process_became_available(&mut self) {
        loop {
            let ids = self.registry.drain_became_available();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                self.pending_loads.retain(|(covalue, _), _| *covalue != id);
                self.answer_waiting(id);
                for (source, piece) in self.parked.remove(&id).unwrap_or_default() {
                    self.apply_content(source, piece);
                }
            }
        }
    }

    fn answer_waiting_if_settled(&mut self, id: CoValueId) {
        if self.aggregate_state(&id) != AggregateState::Loading {
            self.answer_waiting(id);
            self.drop_parked(id);
        }
    }

    /// Give up on content parked for an account that was not found.
    fn drop_parked(&mut self, account: CoValueId) {
        if self.registry.is_available(&account) {
            return;
        }
        for (source, piece) in self.parked.remove(&account).unwrap_or_default() {
            debug!(id = %piece.id, account = %account, "account not found, parked content dropped");
            if let LoadSource::Peer(peer) = source {
                self.send_ack(&peer, piece.id);
            }
        }
    }

    fn answer_waiting(&mut self, id: CoValueId) {
        let Some(waiters) = self.waiting.remove(&id) else {
            return;
        };
        let available = self.registry.is_available(&id);
        for peer in waiters {
            if available {
                self.send_known_and_content(&peer, id);
            } else {
                self.send_known(&peer, id);
            }
        }
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Answer a load with our state, including what an in-flight stream will bring.
    fn send_known(&mut self, peer: &PeerId, id: CoValueId) {
        let known = self.registry.entry(id).known_state_with_streaming();
        if let Some(state) = self.peers.get_mut(peer) {
            state.push(SyncMessage::Known(KnownMessage::from(&known)));
        }
    }

    /// Acknowledge content with what we actually hold.
    fn send_ack(&mut self, peer: &PeerId, id: CoValueId) {
        let known = self.registry.entry(id).known_state();
        if let Some(state) = self.peers.get_mut(peer) {
            state.push(SyncMessage::Known(KnownMessage::from(&known)));
        }
    }

    /// Answer a load: dependencies first, then our known state and the diff.
    fn send_known_and_content(&mut self, peer: &PeerId, id: CoValueId) {
        let mut dependencies = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if current != id {
                    dependencies.push(current);
                }
                continue;
            }
            stack.push((current, true));
            if let Some(core) = self.registry.get(&current) {
                for dependency in core.dependencies() {
                    if visited.insert(*dependency) {
                        stack.push((*dependency, false));
                    }
                }
            }
        }

        for dependency in dependencies {
            let acknowledged = self
                .peers
                .get(peer)
                .and_then(|p| p.optimistic_known_state(&dependency))
                .is_some_and(|k| k.header);
            if !acknowledged && self.registry.is_available(&dependency) {
                let known = self.registry.entry(dependency).known_state();
                if let Some(state) = self.peers.get_mut(peer) {
                    state.push(SyncMessage::Known(KnownMessage::from(&known).with_dependant(id)));
                }
                self.send_new_content(peer, dependency);
            }
        }

        self.send_known(peer, id);
        self.send_new_content(peer, id);
    }

    /// Send whatever `peer` is not assumed to have of `id`.
    fn send_new_content(&mut self, peer: &PeerId, id: CoValueId) {
        let Some(log) = self.registry.verified(&id) else {
            return;
        };
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        let since = state.optimistic_known_state(&id).cloned();
        if let Some(pieces) = log.new_content_since(since.as_ref()) {
            trace!(id = %id, peer = %peer, pieces = pieces.len(), "sending content");
            for piece in pieces {
                state.push(SyncMessage::Content(piece));
            }
            state.combine_optimistic(log.known_state());
            state.mark_told(id);
        }
    }

    /// Push `id` to every server and every interested client except `except`.
    fn broadcast(&mut self, id: CoValueId, except: Option<&PeerId>) {
        let servers: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_server() && !p.is_errored(&id) && Some(p.id()) != except)
            .map(|p| p.id().clone())
            .collect();
        let mut targets = match self.config.max_server_peers {
            Some(n) => select_peers(&id, &servers, n),
            None => servers,
        };
        targets.extend(
            self.peers
                .values()
                .filter(|p| !p.is_server() && p.is_interested(&id) && !p.is_errored(&id))
                .filter(|p| Some(p.id()) != except)
                .map(|p| p.id().clone()),
        );
        for peer in targets {
            self.send_new_content(&peer, id);
        }
    }

    /// Write what storage is missing of `id`.
    fn persist(&mut self, id: CoValueId) {
        let Some(storage) = self.storage.clone() else {
            return;
        };
        let Some(log) = self.registry.verified(&id) else {
            return;
        };

        let stored = match storage.known_state(&id) {
            Ok(stored) => stored,
            Err(e) => {
                error!(id = %id, error = %e, "storage known state failed");
                return;
            }
        };
        let Some(pieces) = log.new_content_since(stored.as_ref()) else {
            return;
        };
        match storage.store(&pieces) {
            Ok(StoreOutcome::Stored) => {
                self.registry
                    .entry(id)
                    .set_loading_status(LoadSource::Storage, LoadingStatus::Available);
            }
            Ok(StoreOutcome::CorrectionNeeded(stored)) => {
                debug!(id = %id, "storage asked for a correction");
                let Some(pieces) = log.new_content_since(Some(&stored)) else {
                    return;
                };
                match storage.store(&pieces) {
                    Ok(StoreOutcome::Stored) => {}
                    Ok(StoreOutcome::CorrectionNeeded(_)) => {
                        error!(id = %id, "storage rejected corrected content")
                    }
                    Err(e) => error!(id = %id, error = %e, "storage write failed"),
                }
            }
            Err(e) => error!(id = %id, error = %e, "storage write failed"),
        }
    }

    /// Persist and push local changes to `id`.
    pub fn sync_local(&mut self, id: CoValueId) {
        self.persist(id);
        self.broadcast(id, None);
    }

    /// Drain every peer's outgoing queue, lane order per peer.
    pub fn take_outgoing(&mut self) -> Vec<(PeerId, SyncMessage)> {
        let mut out = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            while let Some(message) = peer.pop() {
                out.push((id.clone(), message));
            }
        }
        out
    }

    /// Deliver coalesced notifications. Once per run-loop turn.
    pub fn flush_notifications(&mut self) -> usize {
        self.registry.flush_notifications()
    }

    /// True once storage and every server or interested peer hold our state of `id`.
    pub fn is_synced(&self, id: &CoValueId) -> bool {
        let Some(log) = self.registry.verified(id) else {
            return false;
        };
        let ours = log.known_state();
        if let Some(storage) = &self.storage {
            match storage.is_synced(ours) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(id = %id, error = %e, "storage sync check failed");
                    return false;
                }
            }
        }
        self.peers
            .values()
            .filter(|p| p.is_server() || p.is_interested(id))
            .all(|p| p.known_state(id).is_some_and(|k| k.covers(ours)))
    }
}
