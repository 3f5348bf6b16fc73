//! The node-wide set of CoValues.
//!
//! `CoValueRegistry` owns every [`CoValueCore`] a node knows about, together
//! with the collaborators they share (crypto, permission evaluator, account
//! resolver). Anything that spans CoValues goes through it: header provision
//! registers dependencies, appends re-run the pipeline and reset the
//! validity of dependants, availability and completion propagate along
//! dependant edges.
//!
//! Notifications are coalesced through a dirty set that is drained by
//! [`CoValueRegistry::flush_notifications`], once per run-loop turn. Local
//! writes and dependency completion bypass the dirty set and notify at once.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::LogConfig;
use crate::covalue::{CoValueCore, Listener, ListenerId};
use crate::crypto::{Blake3Hash, CryptoProvider, Signature, SignerId, SignerSecret, StandardCrypto};
use crate::error::{CoreError, ResolveAccountAgentError, TryAddTransactionsError};
use crate::header::{CoValueHeader, CoValueType, Ruleset};
use crate::ids::{Author, CoValueId, SessionId};
use crate::known_state::SessionCounts;
use crate::permissions::{
    AccountResolver, AllowAll, HeaderAccountResolver, PermissionEvaluator,
};
use crate::transaction::Transaction;
use crate::verified_state::VerifiedState;

/// Upper bound on nodes visited when looking for a dependency cycle.
const CYCLE_SCAN_BUDGET: usize = 10_000;

pub struct CoValueRegistry {
    covalues: HashMap<CoValueId, CoValueCore>,
    dirty: BTreeSet<CoValueId>,
    became_available: Vec<CoValueId>,
    crypto: Arc<dyn CryptoProvider>,
    evaluator: Box<dyn PermissionEvaluator>,
    resolver: Box<dyn AccountResolver>,
    log_config: LogConfig,
    skip_private: bool,
}

impl std::fmt::Debug for CoValueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoValueRegistry")
            .field("covalues", &self.covalues.len())
            .field("dirty", &self.dirty)
            .field("log_config", &self.log_config)
            .finish()
    }
}

impl Default for CoValueRegistry {
    fn default() -> Self {
        Self::new(Arc::new(StandardCrypto))
    }
}

impl CoValueRegistry {
    pub fn new(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            covalues: HashMap::new(),
            dirty: BTreeSet::new(),
            became_available: Vec::new(),
            crypto,
            evaluator: Box::new(AllowAll),
            resolver: Box::new(HeaderAccountResolver),
            log_config: LogConfig::default(),
            skip_private: false,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Box<dyn PermissionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn AccountResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_log_config(mut self, config: LogConfig) -> Self {
        self.log_config = config;
        self
    }

    /// Leave private transactions undecrypted.
    pub fn with_skip_private(mut self, skip: bool) -> Self {
        self.skip_private = skip;
        self
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn log_config(&self) -> &LogConfig {
        &self.log_config
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&self, id: &CoValueId) -> Option<&CoValueCore> {
        self.covalues.get(id)
    }

    pub fn get_mut(&mut self, id: &CoValueId) -> Option<&mut CoValueCore> {
        self.covalues.get_mut(id)
    }

    /// The core for `id`, created empty if unseen.
    pub fn entry(&mut self, id: CoValueId) -> &mut CoValueCore {
        self.covalues
            .entry(id)
            .or_insert_with(|| CoValueCore::new(id))
    }

    pub fn contains(&self, id: &CoValueId) -> bool {
        self.covalues.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &CoValueId> {
        self.covalues.keys()
    }

    pub fn len(&self) -> usize {
        self.covalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.covalues.is_empty()
    }

    pub fn verified(&self, id: &CoValueId) -> Option<&VerifiedState> {
        self.covalues.get(id).and_then(CoValueCore::verified)
    }

    pub fn is_available(&self, id: &CoValueId) -> bool {
        self.covalues.get(id).is_some_and(CoValueCore::is_available)
    }

    pub fn is_complete(&self, id: &CoValueId) -> bool {
        self.covalues.get(id).is_some_and(CoValueCore::is_complete)
    }

    /// CoValues that gained a header since the last call.
    pub fn drain_became_available(&mut self) -> Vec<CoValueId> {
        std::mem::take(&mut self.became_available)
    }

    // ========================================================================
    // Log mutation
    // ========================================================================

    /// Install the header of `id`, creating its Log Store.
    ///
    /// The header must hash to `id` unless `skip_verify` is set. Header
    /// dependencies are registered before the first pipeline pass.
    ///
    /// # Panics
    ///
    /// If `id` already has a header.
    pub fn provide_header(
        &mut self,
        id: CoValueId,
        header: CoValueHeader,
        streaming: Option<&SessionCounts>,
        skip_verify: bool,
    ) -> Result<(), CoreError> {
        if !skip_verify {
            let actual = self.crypto.covalue_id(&header);
            if actual != id {
                return Err(CoreError::IdMismatch {
                    expected: id,
                    actual,
                });
            }
        }

        let dependencies = header.dependencies();
        let mut state = VerifiedState::new(id, header, self.log_config);
        if let Some(until) = streaming {
            state.set_streaming_known_state(until);
        }
        self.entry(id).set_verified(state);
        debug!(id = %id, deps = dependencies.len(), "header provided");

        for dependency in dependencies {
            self.add_dependency(id, dependency);
        }
        self.run_pipeline(&id);
        self.became_available.push(id);
        self.on_availability_change(id);
        self.schedule_notify(id);
        Ok(())
    }

    /// Verify and append transactions received from outside.
    ///
    /// The signer is resolved from the session author. An account that
    /// cannot be resolved yet becomes a dependency and the error is returned
    /// for a later retry.
    #[allow(clippy::too_many_arguments)]
    pub fn try_add_transactions(
        &mut self,
        id: &CoValueId,
        session: SessionId,
        new_transactions: &[Transaction],
        expected_hash: Option<&Blake3Hash>,
        signature: Signature,
        skip_verify: bool,
    ) -> Result<(), TryAddTransactionsError> {
        if !self.is_available(id) {
            return Err(TryAddTransactionsError::TriedToAddTransactionsWithoutVerifiedState(*id));
        }

        let signer = if skip_verify {
            None
        } else {
            Some(self.resolve_signer(id, session.author())?)
        };

        let crypto = Arc::clone(&self.crypto);
        let Some(state) = self.covalues.get_mut(id).and_then(CoValueCore::verified_mut) else {
            return Err(TryAddTransactionsError::TriedToAddTransactionsWithoutVerifiedState(*id));
        };
        let was_streaming = state.is_streaming();
        state.try_add_transactions(
            crypto.as_ref(),
            session,
            signer.as_ref(),
            new_transactions,
            expected_hash,
            signature,
            skip_verify,
        )?;
        let streaming_done = was_streaming && !state.is_streaming();
        trace!(id = %id, session = %session, count = new_transactions.len(), "transactions added");

        self.after_append(*id);
        if streaming_done {
            self.on_availability_change(*id);
        }
        self.schedule_notify(*id);
        Ok(())
    }

    /// Sign and append a local transaction, notifying listeners at once.
    pub fn add_local_transaction(
        &mut self,
        id: &CoValueId,
        session: SessionId,
        secret: &SignerSecret,
        tx: Transaction,
    ) -> Result<Signature, TryAddTransactionsError> {
        let crypto = Arc::clone(&self.crypto);
        let Some(state) = self.covalues.get_mut(id).and_then(CoValueCore::verified_mut) else {
            return Err(TryAddTransactionsError::TriedToAddTransactionsWithoutVerifiedState(*id));
        };
        let signature = state.add_local_transaction(crypto.as_ref(), session, secret, tx);
        self.after_append(*id);
        self.notify_now(id);
        Ok(signature)
    }

    /// Keep a received piece boundary as a checkpoint of `session`.
    pub fn record_checkpoint(
        &mut self,
        id: &CoValueId,
        session: &SessionId,
        index: u32,
        signature: Signature,
    ) {
        if let Some(state) = self.covalues.get_mut(id).and_then(CoValueCore::verified_mut) {
            state.record_checkpoint(session, index, signature);
        }
    }

    /// Raise the announced ceiling of an in-flight transfer.
    pub fn expect_content_until(&mut self, id: &CoValueId, until: &SessionCounts) {
        if let Some(state) = self.covalues.get_mut(id).and_then(CoValueCore::verified_mut) {
            state.set_streaming_known_state(until);
        }
    }

    /// Signer for a session author of `id`.
    ///
    /// An unresolvable account is registered as a dependency of `id`.
    pub fn resolve_signer(
        &mut self,
        id: &CoValueId,
        author: &Author,
    ) -> Result<SignerId, ResolveAccountAgentError> {
        let account_id = match author {
            Author::Agent(signer) => return Ok(*signer),
            Author::Account(account_id) => *account_id,
        };
        match self
            .resolver
            .signer_for(&account_id, self.verified(&account_id))
        {
            Ok(signer) => Ok(signer),
            Err(e) => {
                debug!(id = %id, account = %account_id, error = %e, "deferring on account");
                self.add_dependency(*id, account_id);
                Err(e)
            }
        }
    }

    fn after_append(&mut self, id: CoValueId) {
        self.run_pipeline(&id);
        self.reset_dependants(id);
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    /// Run one incremental pipeline pass for `id`.
    pub fn run_pipeline(&mut self, id: &CoValueId) {
        // Detach the core so the evaluator can see every other CoValue.
        let Some(mut core) = self.covalues.remove(id) else {
            return;
        };
        core.run_pipeline(
            self,
            self.evaluator.as_ref(),
            self.crypto.as_ref(),
            self.skip_private,
        );
        self.covalues.insert(*id, core);
    }

    /// Throw away derived validity for `id` and rebuild it.
    pub fn reset_validation(&mut self, id: &CoValueId) {
        if let Some(core) = self.covalues.get_mut(id) {
            core.pipeline.reset_validation();
        }
        self.run_pipeline(id);
        self.schedule_notify(*id);
    }

    /// Re-validate everything whose permissions hang off `changed`.
    ///
    /// Groups propagate further, so a change to a parent group reaches
    /// every CoValue owned by a group it governs.
    fn reset_dependants(&mut self, changed: CoValueId) {
        let mut queue = VecDeque::from([changed]);
        let mut seen = BTreeSet::from([changed]);

        while let Some(id) = queue.pop_front() {
            let dependants: Vec<CoValueId> = self
                .covalues
                .get(&id)
                .map(|c| c.dependants.iter().copied().collect())
                .unwrap_or_default();

            for dependant in dependants {
                if !self.is_governed_by(&dependant, &id) || !seen.insert(dependant) {
                    continue;
                }
                trace!(id = %dependant, group = %id, "permission context changed");
                self.reset_validation(&dependant);
                if self.type_of(&dependant) == Some(CoValueType::Group) {
                    queue.push_back(dependant);
                }
            }
        }
    }

    fn is_governed_by(&self, id: &CoValueId, group: &CoValueId) -> bool {
        self.verified(id).is_some_and(|state| {
            matches!(&state.header().ruleset, Ruleset::OwnedByGroup { group: g } if g == group)
        })
    }

    fn type_of(&self, id: &CoValueId) -> Option<CoValueType> {
        self.verified(id).map(|s| s.header().type_tag)
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    /// Record that `dependant` needs `dependency`.
    ///
    /// A dependency that closes a cycle is still recorded, but never marks
    /// the dependant incomplete, so the cycle cannot hold itself back.
    pub fn add_dependency(&mut self, dependant: CoValueId, dependency: CoValueId) {
        if dependant == dependency {
            return;
        }
        self.entry(dependency).dependants.insert(dependant);
        let core = self.entry(dependant);
        if !core.dependencies.insert(dependency) {
            return;
        }

        let available = self.is_available(&dependency);
        let complete = self.is_complete(&dependency);
        let cyclic = !complete && self.reaches(dependency, dependant);
        if cyclic {
            debug!(id = %dependant, dependency = %dependency, "dependency cycle, not propagating");
        }

        let core = self.entry(dependant);
        if !available {
            core.missing.insert(dependency);
        } else if !complete && !cyclic {
            core.incomplete.insert(dependency);
        }
    }

    /// Iterative DFS from `from` over outstanding dependencies.
    ///
    /// Running out of budget is reported as a cycle.
    fn reaches(&self, from: CoValueId, target: CoValueId) -> bool {
        let mut stack = vec![from];
        let mut visited = BTreeSet::new();

        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if visited.len() > CYCLE_SCAN_BUDGET {
                return true;
            }
            if let Some(core) = self.covalues.get(&id) {
                stack.extend(core.missing.iter().chain(core.incomplete.iter()).copied());
            }
        }
        false
    }

    /// Walk dependant edges after `changed` became available or complete.
    fn on_availability_change(&mut self, changed: CoValueId) {
        let mut queue = VecDeque::from([changed]);
        let mut visited = BTreeSet::new();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let available = self.is_available(&id);
            let complete = self.is_complete(&id);
            let dependants: Vec<CoValueId> = self
                .covalues
                .get(&id)
                .map(|c| c.dependants.iter().copied().collect())
                .unwrap_or_default();

            for dependant in dependants {
                let was_complete = self.is_complete(&dependant);
                let cyclic = !complete && self.reaches(id, dependant);
                let Some(core) = self.covalues.get_mut(&dependant) else {
                    continue;
                };

                let mut changed = false;
                if available && core.missing.remove(&id) {
                    changed = true;
                    if !complete && !cyclic {
                        core.incomplete.insert(id);
                    }
                }
                if (complete || cyclic) && core.incomplete.remove(&id) {
                    changed = true;
                }
                if !changed {
                    continue;
                }

                debug!(id = %dependant, dependency = %id, "dependency satisfied");
                if available && self.is_governed_by(&dependant, &id) {
                    self.reset_validation(&dependant);
                } else {
                    self.run_pipeline(&dependant);
                }
                self.notify_now(&dependant);

                if self.is_complete(&dependant) != was_complete {
                    queue.push_back(dependant);
                }
            }
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    pub fn subscribe(&mut self, id: CoValueId, listener: Listener) -> ListenerId {
        self.entry(id).subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: &CoValueId, listener: ListenerId) -> bool {
        self.covalues
            .get_mut(id)
            .is_some_and(|core| core.unsubscribe(listener))
    }

    /// Mark `id` for delivery at the next flush.
    pub fn schedule_notify(&mut self, id: CoValueId) {
        self.dirty.insert(id);
    }

    /// Deliver to listeners of `id` now, dropping any scheduled delivery.
    pub fn notify_now(&mut self, id: &CoValueId) {
        self.dirty.remove(id);
        if let Some(core) = self.covalues.get_mut(id) {
            core.notify();
        }
    }

    /// Deliver one notification per dirty CoValue.
    pub fn flush_notifications(&mut self) -> usize {
        let dirty = std::mem::take(&mut self.dirty);
        let count = dirty.len();
        for id in dirty {
            if let Some(core) = self.covalues.get_mut(&id) {
                core.notify();
            }
        }
        count
    }

    pub fn has_pending_notifications(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn pause(&mut self, id: &CoValueId) {
        if let Some(core) = self.covalues.get_mut(id) {
            core.pause_notifications();
        }
    }

    pub fn resume(&mut self, id: &CoValueId) {
        if let Some(core) = self.covalues.get_mut(id) {
            core.resume_notifications();
        }
    }
}
