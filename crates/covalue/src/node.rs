//! The local node: identity, session, local writes and branches.
//!
//! A [`LocalNode`] owns one agent secret and writes under one session. It
//! wraps a [`SyncManager`], so every local change is persisted and pushed to
//! peers the moment it is made, and a [`SyncDriver`](covalue_sync::SyncDriver)
//! can drive the node directly.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use serde_json::{Map, Value};
use tracing::{debug, info};

use covalue_core::{
    combine_counts, map_set, AggregateState, Author, CoValueHeader, CoValueId, CoValueRegistry,
    CoValueType, ContentView, KeySecret, KnownState, Listener, ListenerId, MergedOrigin,
    MetaRecord, NonceMaterial, PermissionEvaluator, Ruleset, SessionCounts, SessionId,
    SignerSecret, Transaction, TransactionId, VerifiedTransaction,
};
use covalue_perms::{GroupRulesEvaluator, KeyRing, Role, SealedKey, X25519PublicKey, X25519StaticSecret};
use covalue_store::Storage;
use covalue_sync::SyncManager;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

/// How the changes of a local transaction are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Privacy {
    /// Plain JSON, readable by anyone holding the log.
    #[default]
    Trusting,
    /// Encrypted with the owning group's current read key.
    Private,
}

/// One participant: an agent, its session and everything it has loaded.
pub struct LocalNode {
    agent: SignerSecret,
    session: SessionId,
    sync: SyncManager,
    keyring: Arc<RwLock<KeyRing>>,
    sealer: X25519StaticSecret,
    config: NodeConfig,
    /// Last `made_at` handed out, so local timestamps never go backwards.
    clock: i64,
}

impl LocalNode {
    /// Create a node with a fresh session for `agent`.
    pub fn new(
        agent: SignerSecret,
        storage: Option<Arc<dyn Storage>>,
        evaluator: Box<dyn PermissionEvaluator>,
        config: NodeConfig,
    ) -> Self {
        Self::assemble(
            agent,
            storage,
            evaluator,
            Arc::new(RwLock::new(KeyRing::new())),
            X25519StaticSecret::generate(),
            config,
        )
    }

    /// Create a node that enforces group roles and reads with its own key ring.
    pub fn with_group_rules(
        agent: SignerSecret,
        storage: Option<Arc<dyn Storage>>,
        config: NodeConfig,
    ) -> Self {
        let keyring = Arc::new(RwLock::new(KeyRing::new()));
        let sealer = X25519StaticSecret::generate();
        let evaluator = GroupRulesEvaluator::new(Arc::clone(&keyring)).with_sealer(sealer.clone());
        Self::assemble(agent, storage, Box::new(evaluator), keyring, sealer, config)
    }

    fn assemble(
        agent: SignerSecret,
        storage: Option<Arc<dyn Storage>>,
        evaluator: Box<dyn PermissionEvaluator>,
        keyring: Arc<RwLock<KeyRing>>,
        sealer: X25519StaticSecret,
        config: NodeConfig,
    ) -> Self {
        let registry = CoValueRegistry::default()
            .with_evaluator(evaluator)
            .with_skip_private(config.skip_private_on_load);
        let mut sync = SyncManager::new(registry, config.sync.clone());
        if let Some(storage) = storage {
            sync = sync.with_storage(storage);
        }
        let session = SessionId::random(Author::Agent(agent.signer_id()));
        debug!(session = %session, "local node started");
        Self {
            agent,
            session,
            sync,
            keyring,
            sealer,
            config,
            clock: 0,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The author local transactions are written as.
    pub fn author(&self) -> Author {
        *self.session.author()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Public half of the key sealed read keys are addressed to.
    pub fn sealer_public_key(&self) -> X25519PublicKey {
        self.sealer.public_key()
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut SyncManager {
        &mut self.sync
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a CoValue and announce it to storage and peers.
    pub fn create_covalue(
        &mut self,
        type_tag: CoValueType,
        ruleset: Ruleset,
        meta: Option<Map<String, Value>>,
    ) -> Result<CoValueId> {
        let mut header = CoValueHeader::new(type_tag, ruleset).with_created_at(self.next_made_at());
        if let Some(meta) = meta {
            header = header.with_meta(meta);
        }
        self.install(header)
    }

    /// Create an account for this agent and write as it from now on.
    pub fn create_account(&mut self) -> Result<CoValueId> {
        let id = self.create_covalue(
            CoValueType::Account,
            Ruleset::Group {
                initial_admin: Author::Agent(self.agent.signer_id()),
            },
            None,
        )?;
        self.session = SessionId::random(Author::Account(id));
        info!(account = %id, session = %self.session, "account created");
        Ok(id)
    }

    /// Create a group administered by this node, with a fresh read key
    /// sealed to ourselves.
    pub fn create_group(&mut self) -> Result<CoValueId> {
        let id = self.create_covalue(
            CoValueType::Group,
            Ruleset::Group {
                initial_admin: self.author(),
            },
            None,
        )?;
        let key_id = self.keyring_mut().rotate(id);
        let key = self.current_read_key(&id)?;
        debug!(group = %id, key = %key_id, "read key created");
        let own = self.sealer.public_key();
        let change = sealed_key_change(id, &key, &own)?;
        self.append(&id, &[change], None, Privacy::Trusting)?;
        Ok(id)
    }

    /// Give `member` a role in `group`. Readers with a `recipient` key also
    /// get the group's current read key sealed to them.
    pub fn add_member(
        &mut self,
        group: &CoValueId,
        member: &Author,
        role: Role,
        recipient: Option<&X25519PublicKey>,
    ) -> Result<TransactionId> {
        let type_tag = self
            .sync
            .registry()
            .verified(group)
            .map(|v| v.header().type_tag)
            .ok_or(NodeError::NotAvailable(*group))?;
        if type_tag != CoValueType::Group {
            return Err(NodeError::NotAGroup(*group));
        }

        let mut changes = vec![role.change_for(member)];
        if let Some(recipient) = recipient.filter(|_| role.can_read()) {
            let key = self.current_read_key(group)?;
            changes.push(sealed_key_change(*group, &key, recipient)?);
        }
        self.append(group, &changes, None, Privacy::Trusting)
    }

    fn install(&mut self, header: CoValueHeader) -> Result<CoValueId> {
        let id = self.sync.registry().crypto().covalue_id(&header);
        if !self.sync.registry().is_available(&id) {
            self.sync
                .registry_mut()
                .provide_header(id, header, None, false)?;
            debug!(id = %id, "covalue created");
        }
        self.sync.sync_local(id);
        Ok(id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a local transaction to `id`.
    ///
    /// Listeners are notified before this returns; storage and peers get
    /// the new content right away.
    pub fn make_transaction(
        &mut self,
        id: &CoValueId,
        changes: &[Value],
        privacy: Privacy,
    ) -> Result<TransactionId> {
        self.append(id, changes, None, privacy)
    }

    fn append(
        &mut self,
        id: &CoValueId,
        changes: &[Value],
        meta: Option<&Value>,
        privacy: Privacy,
    ) -> Result<TransactionId> {
        let made_at = self.next_made_at();
        let (tx_id, tx) = {
            let registry = self.sync.registry();
            let verified = registry.verified(id).ok_or(NodeError::NotAvailable(*id))?;
            let tx_id = TransactionId::new(self.session, verified.transaction_count(&self.session));
            let tx = match privacy {
                Privacy::Trusting => Transaction::trusting(changes, meta, made_at)?,
                Privacy::Private => {
                    let group = key_owner(id, &verified.header().ruleset)
                        .ok_or(NodeError::NoReadKey(*id))?;
                    let key = self.current_read_key(&group)?;
                    let nonce = NonceMaterial {
                        covalue: *id,
                        tx: tx_id,
                    };
                    Transaction::private(registry.crypto(), &key, &nonce, changes, meta, made_at)?
                }
            };
            (tx_id, tx)
        };

        self.sync
            .registry_mut()
            .add_local_transaction(id, self.session, &self.agent, tx)?;
        self.sync.sync_local(*id);
        Ok(tx_id)
    }

    fn current_read_key(&self, group: &CoValueId) -> Result<KeySecret> {
        self.keyring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current_for(group)
            .cloned()
            .ok_or(NodeError::NoReadKey(*group))
    }

    fn keyring_mut(&self) -> RwLockWriteGuard<'_, KeyRing> {
        self.keyring.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_made_at(&mut self) -> i64 {
        self.clock = self.clock.max(now_millis());
        self.clock
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Branches
    // ─────────────────────────────────────────────────────────────────────────

    /// Branch `source` at its current known state.
    ///
    /// The branch records where it started in its first transaction, and the
    /// source gets a pointer to the branch.
    pub fn create_branch(&mut self, source: &CoValueId, name: &str) -> Result<CoValueId> {
        let created_at = self.next_made_at();
        let (header, start) = {
            let verified = self
                .sync
                .registry()
                .verified(source)
                .ok_or(NodeError::NotAvailable(*source))?;
            let header = CoValueHeader::new(
                verified.header().type_tag,
                verified.header().ruleset.clone(),
            )
            .with_created_at(created_at)
            .with_branch_of(*source, name);
            (header, verified.known_state().sessions.clone())
        };

        let branch = self.install(header)?;
        let start_meta = MetaRecord::BranchStart(start).to_meta();
        self.append(&branch, &[], Some(&start_meta), Privacy::Trusting)?;
        let pointer = MetaRecord::BranchPointer {
            branch,
            name: name.to_owned(),
        }
        .to_meta();
        self.append(source, &[], Some(&pointer), Privacy::Trusting)?;
        info!(source = %source, branch = %branch, name, "branch created");
        Ok(branch)
    }

    /// Copy every not yet merged branch transaction into the source, then
    /// record a merge commit. Returns how many transactions were carried over.
    pub fn merge_branch(&mut self, branch: &CoValueId) -> Result<usize> {
        let (source, carried, sessions) = {
            let registry = self.sync.registry();
            let core = registry
                .get(branch)
                .filter(|c| c.is_available())
                .ok_or(NodeError::NotAvailable(*branch))?;
            let verified = core.verified().ok_or(NodeError::NotAvailable(*branch))?;
            let source = verified
                .header()
                .branch_source()
                .ok_or(NodeError::NotABranch(*branch))?;
            let source_core = registry
                .get(&source)
                .filter(|c| c.is_available())
                .ok_or(NodeError::NotAvailable(source))?;

            let mut merged = SessionCounts::new();
            for commit in source_core
                .branch()
                .merge_commits
                .iter()
                .filter(|m| &m.branch == branch)
            {
                combine_counts(&mut merged, &commit.sessions);
            }

            let carried: Vec<(MergedOrigin, Vec<Value>, Privacy)> = core
                .ordered_valid_transactions()
                .into_iter()
                .filter(|tx| tx.id.index >= merged.get(&tx.id.session).copied().unwrap_or(0))
                .filter_map(|tx| {
                    let changes = tx.changes.as_ref().filter(|c| !c.is_empty())?;
                    let origin = MergedOrigin {
                        tx: tx.logical_id,
                        made_at: tx.logical_made_at,
                    };
                    let privacy = if tx.tx.is_private() {
                        Privacy::Private
                    } else {
                        Privacy::Trusting
                    };
                    Some((origin, changes.clone(), privacy))
                })
                .collect();
            (source, carried, verified.known_state().sessions.clone())
        };

        for (origin, changes, privacy) in &carried {
            // A merged copy may not claim to predate its origin.
            self.clock = self.clock.max(origin.made_at);
            let meta = MetaRecord::Merged(*origin).to_meta();
            self.append(&source, changes, Some(&meta), *privacy)?;
        }
        let commit = MetaRecord::MergeCommit {
            branch: *branch,
            sessions,
        }
        .to_meta();
        self.append(&source, &[], Some(&commit), Privacy::Trusting)?;
        info!(source = %source, branch = %branch, carried = carried.len(), "branch merged");
        Ok(carried.len())
    }

    /// Content of a branch: the source up to the branch point plus the
    /// branch's own transactions.
    pub fn branch_content(&self, branch: &CoValueId) -> Result<ContentView> {
        let registry = self.sync.registry();
        let core = registry
            .get(branch)
            .filter(|c| c.is_available())
            .ok_or(NodeError::NotAvailable(*branch))?;
        let verified = core.verified().ok_or(NodeError::NotAvailable(*branch))?;
        let source = verified
            .header()
            .branch_source()
            .ok_or(NodeError::NotABranch(*branch))?;
        let start = core.branch().branch_start.clone().unwrap_or_default();

        let mut txs: Vec<&VerifiedTransaction> = core.ordered_valid_transactions();
        if let Some(source_core) = registry.get(&source) {
            txs.extend(
                source_core
                    .ordered_valid_transactions()
                    .into_iter()
                    .filter(|tx| tx.id.index < start.get(&tx.id.session).copied().unwrap_or(0)),
            );
        }
        txs.sort_by(|a, b| {
            (a.logical_made_at, &a.logical_id).cmp(&(b.logical_made_at, &b.logical_id))
        });

        let mut view = ContentView::for_type(verified.header().type_tag);
        for tx in txs {
            view.apply(tx);
        }
        Ok(view)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Start loading `id` from storage, then from server peers.
    pub fn load(&mut self, id: CoValueId) -> AggregateState {
        self.sync.load(id)
    }

    pub fn content(&self, id: &CoValueId) -> Result<ContentView> {
        self.sync
            .registry()
            .get(id)
            .and_then(|core| core.content())
            .ok_or(NodeError::NotAvailable(*id))
    }

    pub fn known_state(&self, id: &CoValueId) -> KnownState {
        self.sync
            .registry()
            .get(id)
            .map_or_else(|| KnownState::empty(*id), |core| core.known_state())
    }

    /// Listen for changes to `id`. Remote changes arrive at the next flush.
    pub fn subscribe(&mut self, id: CoValueId, listener: Listener) -> ListenerId {
        self.sync.registry_mut().subscribe(id, listener)
    }

    pub fn unsubscribe(&mut self, id: &CoValueId, listener: ListenerId) -> bool {
        self.sync.registry_mut().unsubscribe(id, listener)
    }
}

impl AsMut<SyncManager> for LocalNode {
    fn as_mut(&mut self) -> &mut SyncManager {
        &mut self.sync
    }
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode")
            .field("session", &self.session)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

/// The group whose read key encrypts private writes to `id`.
fn key_owner(id: &CoValueId, ruleset: &Ruleset) -> Option<CoValueId> {
    match ruleset {
        Ruleset::OwnedByGroup { group } => Some(*group),
        Ruleset::Group { .. } => Some(*id),
        Ruleset::UnsafeAllowAll => None,
    }
}

fn sealed_key_change(
    group: CoValueId,
    key: &KeySecret,
    recipient: &X25519PublicKey,
) -> Result<Value> {
    let sealed = SealedKey::seal(group, key, recipient)?;
    Ok(map_set(
        &SealedKey::entry_name(&key.key_id(), recipient),
        sealed.to_value()?,
    ))
}

/// Get current timestamp in milliseconds.
fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
