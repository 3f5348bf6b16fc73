//! Incremental transaction processing: ingest, validate, decrypt, parse meta.
//!
//! Each stage works off its own queue of record indices, so a pass only
//! touches transactions that are new or still waiting on something (a
//! permission decision, a read key). Signatures were checked by the Log Store
//! on append and are never looked at again here.

use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::branch::{BranchPointer, BranchState, MergeCommit, MetaRecord};
use crate::crypto::{CryptoProvider, NonceMaterial};
use crate::ids::{Author, TransactionId};
use crate::known_state::SessionCounts;
use crate::permissions::{PermissionEvaluator, ValidationContext};
use crate::transaction::{decrypt_private, Transaction};
use crate::verified_state::VerifiedState;

/// Permission verdict for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Pending,
    Valid,
    Invalid(String),
}

impl Validity {
    pub fn is_pending(&self) -> bool {
        matches!(self, Validity::Pending)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// A log transaction enriched with derived state.
#[derive(Debug, Clone)]
pub struct VerifiedTransaction {
    pub id: TransactionId,
    pub tx: Transaction,
    pub validity: Validity,
    /// Decoded change list; `None` until decrypted for private transactions.
    pub changes: Option<Vec<Value>>,
    pub meta: Option<Value>,
    /// Position this transaction stands for; differs from `id` for merged ones.
    pub logical_id: TransactionId,
    pub logical_made_at: i64,
    pub record: Option<MetaRecord>,
}

impl VerifiedTransaction {
    fn from_log(id: TransactionId, tx: &Transaction) -> Self {
        let mut record = Self {
            id,
            tx: tx.clone(),
            validity: Validity::Pending,
            changes: None,
            meta: None,
            logical_id: id,
            logical_made_at: tx.made_at(),
            record: None,
        };
        if let Transaction::Trusting { changes, meta, .. } = tx {
            match serde_json::from_str::<Vec<Value>>(changes) {
                Ok(parsed) => record.changes = Some(parsed),
                Err(e) => record.validity = Validity::Invalid(format!("malformed changes: {e}")),
            }
            record.meta = meta.as_deref().and_then(|m| serde_json::from_str(m).ok());
        }
        record
    }

    pub fn author(&self) -> &Author {
        self.id.session.author()
    }

    pub fn made_at(&self) -> i64 {
        self.tx.made_at()
    }

    fn reset(&mut self) {
        if !matches!(&self.validity, Validity::Invalid(reason) if reason.starts_with("malformed")) {
            self.validity = Validity::Pending;
        }
        self.logical_id = self.id;
        self.logical_made_at = self.tx.made_at();
        self.record = None;
    }
}

/// Per-CoValue pipeline state.
#[derive(Debug, Default)]
pub struct TransactionPipeline {
    records: Vec<VerifiedTransaction>,
    ingested: SessionCounts,
    to_validate: VecDeque<usize>,
    to_decrypt: VecDeque<usize>,
    to_parse: VecDeque<usize>,
    branch: BranchState,
    passes: u64,
}

impl TransactionPipeline {
    pub fn records(&self) -> &[VerifiedTransaction] {
        &self.records
    }

    pub fn branch(&self) -> &BranchState {
        &self.branch
    }

    /// Number of passes run, for observing incremental behavior.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Forget all derived validity and branch state and re-queue everything.
    pub fn reset_validation(&mut self) {
        self.branch = BranchState::default();
        self.to_validate.clear();
        self.to_decrypt.clear();
        self.to_parse.clear();
        for (idx, record) in self.records.iter_mut().enumerate() {
            record.reset();
            if record.validity.is_pending() {
                self.to_validate.push_back(idx);
            }
        }
    }

    /// Run all four stages once.
    pub fn run(
        &mut self,
        state: &VerifiedState,
        ctx: &ValidationContext<'_>,
        evaluator: &dyn PermissionEvaluator,
        crypto: &dyn CryptoProvider,
        skip_private: bool,
    ) {
        self.passes += 1;
        self.ingest(state);
        self.validate(ctx, evaluator);
        if !skip_private {
            self.decrypt(ctx, evaluator, crypto);
        }
        self.parse_meta();
    }

    fn ingest(&mut self, state: &VerifiedState) {
        for (session, log) in state.sessions() {
            let from = self.ingested.get(session).copied().unwrap_or(0);
            if from >= log.len() {
                continue;
            }
            for (offset, tx) in log.transactions()[from as usize..].iter().enumerate() {
                let id = TransactionId::new(*session, from + offset as u32);
                self.to_validate.push_back(self.records.len());
                self.records.push(VerifiedTransaction::from_log(id, tx));
            }
            self.ingested.insert(*session, log.len());
        }
    }

    fn validate(&mut self, ctx: &ValidationContext<'_>, evaluator: &dyn PermissionEvaluator) {
        if self.to_validate.is_empty() {
            return;
        }
        evaluator.determine_validity(ctx, &mut self.records);

        let queued = std::mem::take(&mut self.to_validate);
        for idx in queued {
            let record = &self.records[idx];
            match &record.validity {
                Validity::Pending => self.to_validate.push_back(idx),
                Validity::Invalid(reason) => {
                    trace!(tx = ?record.id, %reason, "transaction invalid");
                }
                Validity::Valid if record.changes.is_none() => self.to_decrypt.push_back(idx),
                Validity::Valid if record.meta.is_some() => self.to_parse.push_back(idx),
                Validity::Valid => {}
            }
        }
    }

    fn decrypt(
        &mut self,
        ctx: &ValidationContext<'_>,
        evaluator: &dyn PermissionEvaluator,
        crypto: &dyn CryptoProvider,
    ) {
        let queued = std::mem::take(&mut self.to_decrypt);
        for idx in queued {
            let record = &mut self.records[idx];
            let Transaction::Private {
                key_used,
                encrypted_changes,
                encrypted_meta,
                ..
            } = &record.tx
            else {
                continue;
            };
            let Some(key) = evaluator.read_key(ctx, key_used) else {
                self.to_decrypt.push_back(idx);
                continue;
            };
            let nonce = NonceMaterial {
                covalue: *ctx.id,
                tx: record.id,
            };
            match decrypt_private(
                crypto,
                &key,
                &nonce,
                encrypted_changes,
                encrypted_meta.as_deref(),
            ) {
                Ok((changes, meta)) => {
                    record.changes = Some(changes);
                    record.meta = meta;
                    if record.meta.is_some() {
                        self.to_parse.push_back(idx);
                    }
                }
                Err(e) => {
                    debug!(tx = ?record.id, error = %e, "could not decrypt transaction");
                    record.validity = Validity::Invalid(format!("undecryptable: {e}"));
                }
            }
        }
    }

    fn parse_meta(&mut self) {
        let queued = std::mem::take(&mut self.to_parse);
        for idx in queued {
            let record = &mut self.records[idx];
            let Some(parsed) = record.meta.as_ref().and_then(MetaRecord::classify) else {
                continue;
            };
            match &parsed {
                MetaRecord::BranchStart(sessions) => {
                    self.branch.branch_start = Some(sessions.clone());
                }
                MetaRecord::BranchPointer { branch, name } => {
                    self.branch.pointers.push(BranchPointer {
                        branch: *branch,
                        name: name.clone(),
                        created_by: record.id,
                    });
                }
                MetaRecord::MergeCommit { branch, sessions } => {
                    self.branch.merge_commits.push(MergeCommit {
                        branch: *branch,
                        sessions: sessions.clone(),
                        committed_by: record.id,
                    });
                }
                MetaRecord::Merged(origin) => {
                    if origin.made_at > record.made_at() {
                        debug!(
                            tx = ?record.id,
                            claimed = origin.made_at,
                            wrapped = record.made_at(),
                            "merged transaction claims an origin after its merge"
                        );
                        record.validity =
                            Validity::Invalid("merged origin is later than merge".into());
                        continue;
                    }
                    record.logical_id = origin.tx;
                    record.logical_made_at = origin.made_at;
                }
            }
            record.record = Some(parsed);
        }
    }

    /// Valid, readable records in materialization order.
    pub fn ordered_valid(&self) -> Vec<&VerifiedTransaction> {
        let mut valid: Vec<&VerifiedTransaction> = self
            .records
            .iter()
            .filter(|r| r.validity.is_valid() && r.changes.is_some())
            .collect();
        valid.sort_by(|a, b| {
            (a.logical_made_at, &a.logical_id).cmp(&(b.logical_made_at, &b.logical_id))
        });
        valid
    }

    /// Records still waiting for a read key.
    pub fn awaiting_keys(&self) -> usize {
        self.to_decrypt.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::config::LogConfig;
    use crate::crypto::{KeyId, KeySecret, SignerSecret, StandardCrypto};
    use crate::header::{CoValueHeader, CoValueType, Ruleset};
    use crate::ids::SessionId;
    use crate::permissions::AllowAll;
    use crate::registry::CoValueRegistry;
    use crate::view::list_append;

    /// Accepts everything and hands out one read key, counting lookups.
    struct KeyHolder {
        key: KeySecret,
        lookups: AtomicUsize,
    }

    impl KeyHolder {
        fn new(key: KeySecret) -> Self {
            Self {
                key,
                lookups: AtomicUsize::new(0),
            }
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    impl PermissionEvaluator for KeyHolder {
        fn determine_validity(&self, ctx: &ValidationContext<'_>, records: &mut [VerifiedTransaction]) {
            AllowAll.determine_validity(ctx, records);
        }

        fn read_key(&self, _ctx: &ValidationContext<'_>, key_id: &KeyId) -> Option<KeySecret> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            (self.key.key_id() == *key_id).then(|| self.key.clone())
        }
    }

    struct Writer {
        secret: SignerSecret,
        session: SessionId,
    }

    fn setup() -> (VerifiedState, Writer) {
        let secret = SignerSecret::from_seed(&[4; 32]);
        let session = SessionId::new(Author::Agent(secret.signer_id()), [4; 8]);
        let header = CoValueHeader::new(CoValueType::List, Ruleset::UnsafeAllowAll)
            .with_uniqueness("pipeline");
        let id = StandardCrypto.covalue_id(&header);
        (
            VerifiedState::new(id, header, LogConfig::default()),
            Writer { secret, session },
        )
    }

    fn add(state: &mut VerifiedState, writer: &Writer, tx: Transaction) {
        state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx);
    }

    fn add_private(state: &mut VerifiedState, writer: &Writer, key: &KeySecret, n: i64) {
        let nonce = NonceMaterial {
            covalue: *state.id(),
            tx: TransactionId::new(writer.session, state.transaction_count(&writer.session)),
        };
        let tx = Transaction::private(&StandardCrypto, key, &nonce, &[list_append(json!(n))], None, n)
            .unwrap();
        add(state, writer, tx);
    }

    fn run(
        pipeline: &mut TransactionPipeline,
        state: &VerifiedState,
        evaluator: &dyn PermissionEvaluator,
        skip_private: bool,
    ) {
        let registry = CoValueRegistry::default();
        let ctx = ValidationContext {
            id: state.id(),
            header: state.header(),
            registry: &registry,
        };
        pipeline.run(state, &ctx, evaluator, &StandardCrypto, skip_private);
    }

    #[test]
    fn test_reset_requeues_without_decrypting_again() {
        let (mut state, writer) = setup();
        let key = KeySecret::generate();
        add_private(&mut state, &writer, &key, 1);
        add_private(&mut state, &writer, &key, 2);
        let evaluator = KeyHolder::new(key);

        let mut pipeline = TransactionPipeline::default();
        run(&mut pipeline, &state, &evaluator, false);
        assert_eq!(pipeline.ordered_valid().len(), 2);
        let lookups = evaluator.lookups();
        assert_eq!(lookups, 2);

        pipeline.reset_validation();
        assert!(pipeline.records().iter().all(|r| r.validity.is_pending()));
        assert!(pipeline.records().iter().all(|r| r.changes.is_some()));

        run(&mut pipeline, &state, &evaluator, false);
        assert!(pipeline.records().iter().all(|r| r.validity.is_valid()));
        assert_eq!(pipeline.ordered_valid().len(), 2);
        assert_eq!(evaluator.lookups(), lookups);
        assert_eq!(pipeline.awaiting_keys(), 0);
        assert_eq!(pipeline.passes(), 2);
    }

    #[test]
    fn test_skip_private_keeps_records_queued() {
        let (mut state, writer) = setup();
        let key = KeySecret::generate();
        add_private(&mut state, &writer, &key, 1);
        add_private(&mut state, &writer, &key, 2);
        let evaluator = KeyHolder::new(key);

        let mut pipeline = TransactionPipeline::default();
        run(&mut pipeline, &state, &evaluator, true);
        assert!(pipeline.records().iter().all(|r| r.validity.is_valid()));
        assert!(pipeline.records().iter().all(|r| r.changes.is_none()));
        assert_eq!(pipeline.awaiting_keys(), 2);
        assert!(pipeline.ordered_valid().is_empty());
        assert_eq!(evaluator.lookups(), 0);

        run(&mut pipeline, &state, &evaluator, false);
        assert_eq!(pipeline.awaiting_keys(), 0);
        let items: Vec<_> = pipeline
            .ordered_valid()
            .iter()
            .map(|r| r.changes.clone().unwrap())
            .collect();
        assert_eq!(items, vec![vec![list_append(json!(1))], vec![list_append(json!(2))]]);
    }

    #[test]
    fn test_missing_key_retried_next_pass() {
        let (mut state, writer) = setup();
        add_private(&mut state, &writer, &KeySecret::generate(), 1);
        let stranger = KeyHolder::new(KeySecret::generate());

        let mut pipeline = TransactionPipeline::default();
        run(&mut pipeline, &state, &stranger, false);
        run(&mut pipeline, &state, &stranger, false);
        assert_eq!(pipeline.awaiting_keys(), 1);
        assert_eq!(stranger.lookups(), 2);
        assert!(pipeline.records()[0].validity.is_valid());
    }

    #[test]
    fn test_malformed_payload_stays_invalid_after_reset() {
        let (mut state, writer) = setup();
        add(
            &mut state,
            &writer,
            Transaction::Trusting {
                made_at: 1,
                changes: "not json".into(),
                meta: None,
            },
        );
        add(
            &mut state,
            &writer,
            Transaction::trusting(&[list_append(json!("ok"))], None, 2).unwrap(),
        );

        let mut pipeline = TransactionPipeline::default();
        run(&mut pipeline, &state, &AllowAll, false);
        assert!(matches!(&pipeline.records()[0].validity, Validity::Invalid(r) if r.starts_with("malformed")));
        assert!(pipeline.records()[1].validity.is_valid());

        pipeline.reset_validation();
        assert!(!pipeline.records()[0].validity.is_pending());
        assert!(pipeline.records()[1].validity.is_pending());

        run(&mut pipeline, &state, &AllowAll, false);
        assert!(matches!(&pipeline.records()[0].validity, Validity::Invalid(r) if r.starts_with("malformed")));
        assert_eq!(pipeline.ordered_valid().len(), 1);
    }
}
