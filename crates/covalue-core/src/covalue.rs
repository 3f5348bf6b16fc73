//! Per-CoValue state: the Log Store once known, per-source loading status,
//! dependency sets and listeners.
//!
//! Operations that need to look at other CoValues (header provision,
//! dependency propagation, pipeline runs) live on
//! [`CoValueRegistry`](crate::registry::CoValueRegistry).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::branch::BranchState;
use crate::crypto::CryptoProvider;
use crate::ids::{CoValueId, PeerId};
use crate::known_state::KnownState;
use crate::permissions::{PermissionEvaluator, ValidationContext};
use crate::pipeline::{TransactionPipeline, VerifiedTransaction};
use crate::registry::CoValueRegistry;
use crate::verified_state::VerifiedState;
use crate::view::ContentView;

// ============================================================================
// Loading
// ============================================================================

/// Where a CoValue can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoadSource {
    Storage,
    Peer(PeerId),
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSource::Storage => write!(f, "storage"),
            LoadSource::Peer(peer) => write!(f, "{peer}"),
        }
    }
}

/// Loading status of a CoValue at one source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadingStatus {
    #[default]
    Unknown,
    Pending,
    Available,
    Unavailable,
    Errored(String),
}

impl LoadingStatus {
    /// Available, unavailable or errored.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoadingStatus::Unknown | LoadingStatus::Pending)
    }
}

/// State of a CoValue across all sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateState {
    Unknown,
    Loading,
    Available,
    Unavailable,
}

// ============================================================================
// Listeners
// ============================================================================

/// Handle for a subscription on one CoValue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Passed to listeners so they can remove themselves.
#[derive(Debug, Default)]
pub struct Unsubscribe {
    requested: bool,
}

impl Unsubscribe {
    pub fn unsubscribe(&mut self) {
        self.requested = true;
    }
}

pub type Listener = Box<dyn FnMut(&CoValueCore, &mut Unsubscribe) + Send>;

// ============================================================================
// CoValueCore
// ============================================================================

pub struct CoValueCore {
    id: CoValueId,
    verified: Option<VerifiedState>,
    loading: BTreeMap<LoadSource, LoadingStatus>,
    pub(crate) dependencies: BTreeSet<CoValueId>,
    pub(crate) dependants: BTreeSet<CoValueId>,
    pub(crate) missing: BTreeSet<CoValueId>,
    pub(crate) incomplete: BTreeSet<CoValueId>,
    pub(crate) pipeline: TransactionPipeline,
    listeners: BTreeMap<ListenerId, Listener>,
    next_listener: u64,
    paused: u32,
    notify_on_resume: bool,
    notifications: u64,
}

impl fmt::Debug for CoValueCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoValueCore")
            .field("id", &self.id)
            .field("available", &self.is_available())
            .field("loading", &self.loading)
            .field("missing", &self.missing)
            .field("incomplete", &self.incomplete)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl CoValueCore {
    pub fn new(id: CoValueId) -> Self {
        Self {
            id,
            verified: None,
            loading: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            dependants: BTreeSet::new(),
            missing: BTreeSet::new(),
            incomplete: BTreeSet::new(),
            pipeline: TransactionPipeline::default(),
            listeners: BTreeMap::new(),
            next_listener: 0,
            paused: 0,
            notify_on_resume: false,
            notifications: 0,
        }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn verified(&self) -> Option<&VerifiedState> {
        self.verified.as_ref()
    }

    pub(crate) fn verified_mut(&mut self) -> Option<&mut VerifiedState> {
        self.verified.as_mut()
    }

    /// Install the Log Store.
    ///
    /// # Panics
    ///
    /// If a header was already provided.
    pub(crate) fn set_verified(&mut self, state: VerifiedState) {
        assert!(
            self.verified.is_none(),
            "header already provided for {}",
            self.id
        );
        self.verified = Some(state);
    }

    /// Header present.
    pub fn is_available(&self) -> bool {
        self.verified.is_some()
    }

    /// Available, not streaming, and every dependency complete.
    pub fn is_complete(&self) -> bool {
        self.verified.as_ref().is_some_and(|v| !v.is_streaming())
            && self.missing.is_empty()
            && self.incomplete.is_empty()
    }

    pub fn is_streaming(&self) -> bool {
        self.verified.as_ref().is_some_and(VerifiedState::is_streaming)
    }

    // ------------------------------------------------------------------------
    // Loading state
    // ------------------------------------------------------------------------

    pub fn loading_status(&self, source: &LoadSource) -> LoadingStatus {
        self.loading.get(source).cloned().unwrap_or_default()
    }

    pub fn loading_statuses(&self) -> impl Iterator<Item = (&LoadSource, &LoadingStatus)> {
        self.loading.iter()
    }

    /// Record a status, returning the previous one.
    pub fn set_loading_status(&mut self, source: LoadSource, status: LoadingStatus) -> LoadingStatus {
        self.loading.insert(source, status).unwrap_or_default()
    }

    pub fn aggregate_state(&self) -> AggregateState {
        if self.is_available() {
            return AggregateState::Available;
        }
        if self.loading.values().any(|s| *s == LoadingStatus::Pending) {
            return AggregateState::Loading;
        }
        if self.loading.is_empty() || self.loading.values().any(|s| *s == LoadingStatus::Unknown) {
            return AggregateState::Unknown;
        }
        AggregateState::Unavailable
    }

    // ------------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------------

    pub fn dependencies(&self) -> &BTreeSet<CoValueId> {
        &self.dependencies
    }

    pub fn dependants(&self) -> &BTreeSet<CoValueId> {
        &self.dependants
    }

    pub fn missing_dependencies(&self) -> &BTreeSet<CoValueId> {
        &self.missing
    }

    pub fn incomplete_dependencies(&self) -> &BTreeSet<CoValueId> {
        &self.incomplete
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    pub fn known_state(&self) -> KnownState {
        match &self.verified {
            Some(v) => v.known_state().clone(),
            None => KnownState::empty(self.id),
        }
    }

    pub fn known_state_with_streaming(&self) -> KnownState {
        match &self.verified {
            Some(v) => v.known_state_with_streaming(),
            None => KnownState::empty(self.id),
        }
    }

    pub fn pipeline(&self) -> &TransactionPipeline {
        &self.pipeline
    }

    /// One pipeline pass. `registry` must not contain this core.
    pub(crate) fn run_pipeline(
        &mut self,
        registry: &CoValueRegistry,
        evaluator: &dyn PermissionEvaluator,
        crypto: &dyn CryptoProvider,
        skip_private: bool,
    ) {
        let Some(state) = self.verified.as_ref() else {
            return;
        };
        let ctx = ValidationContext {
            id: &self.id,
            header: state.header(),
            registry,
        };
        self.pipeline.run(state, &ctx, evaluator, crypto, skip_private);
    }

    pub fn branch(&self) -> &BranchState {
        self.pipeline.branch()
    }

    /// Valid, decrypted transactions by logical `madeAt`, then logical id.
    pub fn ordered_valid_transactions(&self) -> Vec<&VerifiedTransaction> {
        self.pipeline.ordered_valid()
    }

    /// Materialized content, or `None` before the header is known.
    pub fn content(&self) -> Option<ContentView> {
        let verified = self.verified.as_ref()?;
        let mut view = ContentView::for_type(verified.header().type_tag);
        for tx in self.ordered_valid_transactions() {
            view.apply(tx);
        }
        Some(view)
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    pub fn subscribe(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.insert(id, listener);
        id
    }

    pub fn unsubscribe(&mut self, listener: ListenerId) -> bool {
        self.listeners.remove(&listener).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliveries made so far.
    pub fn notification_count(&self) -> u64 {
        self.notifications
    }

    pub fn pause_notifications(&mut self) {
        self.paused += 1;
    }

    /// Undo one pause. The last resume delivers a held notification.
    pub fn resume_notifications(&mut self) {
        self.paused = self.paused.saturating_sub(1);
        if self.paused == 0 && self.notify_on_resume {
            self.notify_on_resume = false;
            self.notify();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused > 0
    }

    /// Deliver to every listener now, or hold the delivery while paused.
    pub(crate) fn notify(&mut self) {
        if self.paused > 0 {
            self.notify_on_resume = true;
            return;
        }
        self.notifications += 1;
        let mut listeners = std::mem::take(&mut self.listeners);
        let this: &CoValueCore = self;
        listeners.retain(|_, listener| {
            let mut unsubscribe = Unsubscribe::default();
            listener(this, &mut unsubscribe);
            !unsubscribe.requested
        });
        self.listeners = listeners;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn core() -> CoValueCore {
        CoValueCore::new(CoValueId::from_bytes([3; 32]))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Listener {
        let counter = Arc::clone(counter);
        Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_aggregate_state_transitions() {
        let mut core = core();
        assert_eq!(core.aggregate_state(), AggregateState::Unknown);

        core.set_loading_status(LoadSource::Storage, LoadingStatus::Unavailable);
        assert_eq!(core.aggregate_state(), AggregateState::Unavailable);

        core.set_loading_status(LoadSource::Peer("a".into()), LoadingStatus::Pending);
        assert_eq!(core.aggregate_state(), AggregateState::Loading);

        core.set_loading_status(LoadSource::Peer("a".into()), LoadingStatus::Unknown);
        assert_eq!(core.aggregate_state(), AggregateState::Unknown);

        core.set_loading_status(
            LoadSource::Peer("a".into()),
            LoadingStatus::Errored("bad".into()),
        );
        assert_eq!(core.aggregate_state(), AggregateState::Unavailable);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let mut core = core();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        core.subscribe(Box::new(move |_, unsubscribe| {
            seen.fetch_add(1, Ordering::SeqCst);
            unsubscribe.unsubscribe();
        }));

        core.notify();
        core.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(core.listener_count(), 0);
    }

    #[test]
    fn test_nested_pause_delivers_once_on_last_resume() {
        let mut core = core();
        let calls = Arc::new(AtomicUsize::new(0));
        core.subscribe(counting(&calls));

        core.pause_notifications();
        core.pause_notifications();
        core.notify();
        core.notify();
        core.resume_notifications();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        core.resume_notifications();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        core.resume_notifications();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_by_id() {
        let mut core = core();
        let calls = Arc::new(AtomicUsize::new(0));
        let id = core.subscribe(counting(&calls));
        assert!(core.unsubscribe(id));
        core.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!core.unsubscribe(id));
    }

    #[test]
    #[should_panic(expected = "header already provided")]
    fn test_second_header_panics() {
        use crate::config::LogConfig;
        use crate::header::{CoValueHeader, CoValueType, Ruleset};

        let mut core = core();
        let header = CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll);
        core.set_verified(VerifiedState::new(*core.id(), header.clone(), LogConfig::default()));
        core.set_verified(VerifiedState::new(*core.id(), header, LogConfig::default()));
    }
}
