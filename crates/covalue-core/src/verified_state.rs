//! The Log Store: header plus per-session transaction logs with signature
//! chain integrity.
//!
//! Every session keeps a rolling hash over its transactions. A signature over
//! that hash is recorded after each append, and additionally kept as a
//! checkpoint whenever enough payload has accumulated since the previous one.
//! Checkpoints are the only places a session is ever split when content is
//! sent to a peer, so a receiver can verify every piece on its own.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use crate::config::LogConfig;
use crate::content::{ContentPiece, SessionNewContent};
use crate::crypto::{Blake3Hash, CryptoProvider, RollingHash, Signature, SignerId, SignerSecret};
use crate::error::TryAddTransactionsError;
use crate::header::CoValueHeader;
use crate::ids::{CoValueId, SessionId};
use crate::known_state::{combine_counts, counts_cover, KnownState, SessionCounts};
use crate::transaction::Transaction;

/// One writer session's append-only log.
#[derive(Debug, Clone)]
pub struct SessionLog {
    transactions: Vec<Transaction>,
    last_signature: Signature,
    /// Checkpoint signatures keyed by the index of the last covered transaction.
    signature_after: BTreeMap<u32, Signature>,
    rolling: RollingHash,
    size_since_checkpoint: usize,
}

impl SessionLog {
    fn new() -> Self {
        Self {
            transactions: Vec::new(),
            last_signature: Signature::ZERO,
            signature_after: BTreeMap::new(),
            rolling: RollingHash::new(),
            size_since_checkpoint: 0,
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn last_signature(&self) -> &Signature {
        &self.last_signature
    }

    pub fn signature_after(&self) -> &BTreeMap<u32, Signature> {
        &self.signature_after
    }

    pub fn last_hash(&self) -> Blake3Hash {
        self.rolling.digest()
    }

    /// First checkpoint at or after index `from`.
    fn next_checkpoint(&self, from: u32) -> Option<(u32, &Signature)> {
        self.signature_after
            .range(from..)
            .next()
            .map(|(idx, sig)| (*idx, sig))
    }
}

/// Header plus verified session logs for one CoValue.
#[derive(Debug)]
pub struct VerifiedState {
    id: CoValueId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    /// Ceiling announced by a peer while a large transfer is in flight.
    streaming_until: Option<SessionCounts>,
    config: LogConfig,
    known_state_cache: OnceCell<KnownState>,
    content_from_empty_cache: OnceCell<Option<Vec<ContentPiece>>>,
}

impl VerifiedState {
    /// Create an empty log. Header identity must already be checked.
    pub fn new(id: CoValueId, header: CoValueHeader, config: LogConfig) -> Self {
        Self {
            id,
            header,
            sessions: BTreeMap::new(),
            streaming_until: None,
            config,
            known_state_cache: OnceCell::new(),
            content_from_empty_cache: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &CoValueId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &SessionLog)> {
        self.sessions.iter()
    }

    pub fn session(&self, session: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    pub fn transaction_count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).map_or(0, SessionLog::len)
    }

    /// Verify and append transactions to a session.
    ///
    /// `expected_hash`, when given, must equal the rolling hash after the new
    /// transactions. The signature must verify under `signer` unless
    /// `skip_verify` is set. On any error nothing is appended.
    #[allow(clippy::too_many_arguments)]
    pub fn try_add_transactions(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        signer: Option<&SignerId>,
        new_transactions: &[Transaction],
        expected_hash: Option<&Blake3Hash>,
        signature: Signature,
        skip_verify: bool,
    ) -> Result<(), TryAddTransactionsError> {
        if new_transactions.is_empty() {
            return Ok(());
        }

        let mut rolling = match self.sessions.get(&session) {
            Some(log) => log.rolling.clone(),
            None => crypto.rolling_hash(),
        };
        for tx in new_transactions {
            rolling.update(&tx.encoded());
        }
        let new_hash = rolling.digest();

        if let Some(expected) = expected_hash {
            if *expected != new_hash {
                return Err(TryAddTransactionsError::InvalidHash {
                    expected: expected.to_hex(),
                    actual: new_hash.to_hex(),
                });
            }
        }

        if !skip_verify {
            let signer = signer.ok_or(TryAddTransactionsError::InvalidSignature)?;
            crypto
                .verify(signer, &new_hash, &signature)
                .map_err(|_| TryAddTransactionsError::InvalidSignature)?;
        }

        self.commit(session, new_transactions, rolling, signature);
        Ok(())
    }

    /// Sign and append one locally produced transaction.
    pub fn add_local_transaction(
        &mut self,
        crypto: &dyn CryptoProvider,
        session: SessionId,
        secret: &SignerSecret,
        tx: Transaction,
    ) -> Signature {
        let mut rolling = match self.sessions.get(&session) {
            Some(log) => log.rolling.clone(),
            None => crypto.rolling_hash(),
        };
        rolling.update(&tx.encoded());
        let signature = crypto.sign(secret, &rolling.digest());
        self.commit(session, std::slice::from_ref(&tx), rolling, signature);
        signature
    }

    fn commit(
        &mut self,
        session: SessionId,
        new_transactions: &[Transaction],
        rolling: RollingHash,
        signature: Signature,
    ) {
        let threshold = self.config.checkpoint_threshold;
        let log = self.sessions.entry(session).or_insert_with(SessionLog::new);
        log.size_since_checkpoint += new_transactions
            .iter()
            .map(Transaction::payload_size)
            .sum::<usize>();
        log.transactions.extend_from_slice(new_transactions);
        log.rolling = rolling;
        log.last_signature = signature;

        if log.size_since_checkpoint > threshold {
            log.signature_after.insert(log.len() - 1, signature);
            log.size_since_checkpoint = 0;
        }
        self.invalidate_caches();
    }

    /// Record a checkpoint received from a trusted source (storage).
    pub fn record_checkpoint(&mut self, session: &SessionId, index: u32, signature: Signature) {
        if let Some(log) = self.sessions.get_mut(session) {
            if index < log.len() {
                log.signature_after.insert(index, signature);
                self.content_from_empty_cache = OnceCell::new();
            }
        }
    }

    fn invalidate_caches(&mut self) {
        self.known_state_cache = OnceCell::new();
        self.content_from_empty_cache = OnceCell::new();
    }

    /// Per-session transaction counts. Cached until the next append.
    pub fn known_state(&self) -> &KnownState {
        self.known_state_cache.get_or_init(|| KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, log)| (*session, log.len()))
                .collect(),
        })
    }

    /// Known state raised to the announced streaming ceiling, if still streaming.
    pub fn known_state_with_streaming(&self) -> KnownState {
        let mut known = self.known_state().clone();
        if let Some(until) = &self.streaming_until {
            if !counts_cover(&known.sessions, until) {
                combine_counts(&mut known.sessions, until);
            }
        }
        known
    }

    /// True while some session is below the announced ceiling.
    pub fn is_streaming(&self) -> bool {
        self.streaming_until
            .as_ref()
            .is_some_and(|until| !counts_cover(&self.known_state().sessions, until))
    }

    /// Remember the full extent of an in-flight transfer.
    pub fn set_streaming_known_state(&mut self, until: &SessionCounts) {
        if counts_cover(&self.known_state().sessions, until) {
            return;
        }
        let ceiling = self.streaming_until.get_or_insert_with(SessionCounts::new);
        combine_counts(ceiling, until);
    }

    /// Content a peer at `known` is missing, chunked into pieces.
    ///
    /// Returns `None` when there is nothing to send.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<ContentPiece>> {
        if known.map_or(true, KnownState::is_empty) {
            return self
                .content_from_empty_cache
                .get_or_init(|| self.compute_content_since(None))
                .clone();
        }
        self.compute_content_since(known)
    }

    fn compute_content_since(&self, known: Option<&KnownState>) -> Option<Vec<ContentPiece>> {
        let priority = self.header.priority();
        let send_header = !known.is_some_and(|k| k.header);
        let mut pieces = vec![ContentPiece::new(
            self.id,
            send_header.then(|| self.header.clone()),
            priority,
        )];
        let mut sent = SessionCounts::new();
        let mut piece_size = 0usize;
        let mut todo: Vec<SessionId> = self.sessions.keys().copied().collect();

        while !todo.is_empty() {
            let mut again = Vec::new();

            for session in todo {
                let Some(log) = self.sessions.get(&session) else {
                    continue;
                };
                let start = sent
                    .get(&session)
                    .copied()
                    .unwrap_or_else(|| known.map_or(0, |k| k.count(&session)));
                let checkpoint = log.next_checkpoint(start);
                let end = checkpoint.map_or(log.len(), |(idx, _)| idx + 1);
                if end <= start {
                    continue;
                }
                if end < log.len() {
                    again.push(session);
                }

                let slice = &log.transactions[start as usize..end as usize];
                let slice_size: usize = slice.iter().map(Transaction::payload_size).sum();

                let current_has_content = pieces.last().is_some_and(|p| !p.new.is_empty());
                if current_has_content && piece_size + slice_size > self.config.max_piece_size {
                    if pieces.len() == 1 {
                        pieces[0].expect_content_until =
                            Some(self.known_state_with_streaming().sessions);
                    }
                    pieces.push(ContentPiece::new(self.id, None, priority));
                    piece_size = 0;
                }
                piece_size += slice_size;

                let last_signature = checkpoint.map_or(log.last_signature, |(_, sig)| *sig);
                if let Some(piece) = pieces.last_mut() {
                    let entry = piece
                        .new
                        .entry(session)
                        .or_insert_with(|| SessionNewContent {
                            after: start,
                            new_transactions: Vec::new(),
                            last_signature,
                        });
                    entry.new_transactions.extend_from_slice(slice);
                    entry.last_signature = last_signature;
                }
                sent.insert(session, end);
            }

            todo = again;
        }

        pieces.retain(|p| !p.is_empty());
        (!pieces.is_empty()).then_some(pieces)
    }

    /// Re-verify every checkpoint and the final signature of a session.
    pub fn verify_checkpoints(
        &self,
        crypto: &dyn CryptoProvider,
        session: &SessionId,
        signer: &SignerId,
    ) -> Result<(), TryAddTransactionsError> {
        let Some(log) = self.sessions.get(session) else {
            return Ok(());
        };
        let mut rolling = crypto.rolling_hash();
        for (idx, tx) in log.transactions.iter().enumerate() {
            rolling.update(&tx.encoded());
            if let Some(sig) = log.signature_after.get(&(idx as u32)) {
                crypto
                    .verify(signer, &rolling.digest(), sig)
                    .map_err(|_| TryAddTransactionsError::InvalidSignature)?;
            }
        }
        crypto
            .verify(signer, &rolling.digest(), &log.last_signature)
            .map_err(|_| TryAddTransactionsError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StandardCrypto;
    use crate::header::{CoValueType, Ruleset};
    use crate::ids::Author;
    use serde_json::json;

    struct Writer {
        secret: SignerSecret,
        session: SessionId,
    }

    impl Writer {
        fn new(seed: u8) -> Self {
            let secret = SignerSecret::from_seed(&[seed; 32]);
            let session = SessionId::new(Author::Agent(secret.signer_id()), [seed; 8]);
            Self { secret, session }
        }
    }

    fn new_state(config: LogConfig) -> VerifiedState {
        let header = CoValueHeader::new(CoValueType::Stream, Ruleset::UnsafeAllowAll);
        let id = StandardCrypto.covalue_id(&header);
        VerifiedState::new(id, header, config)
    }

    fn tx(n: usize, payload: usize) -> Transaction {
        Transaction::trusting(&[json!({"n": n, "pad": "x".repeat(payload)})], None, n as i64)
            .unwrap()
    }

    fn replica_of(source: &VerifiedState) -> VerifiedState {
        VerifiedState::new(*source.id(), source.header().clone(), LogConfig::default())
    }

    fn apply(target: &mut VerifiedState, piece: &ContentPiece, writer: &Writer) {
        for (session, content) in &piece.new {
            let have = target.transaction_count(session);
            assert!(content.after <= have, "gap in test data");
            let skip = (have - content.after) as usize;
            if skip >= content.new_transactions.len() {
                continue;
            }
            target
                .try_add_transactions(
                    &StandardCrypto,
                    *session,
                    Some(&writer.secret.signer_id()),
                    &content.new_transactions[skip..],
                    None,
                    content.last_signature,
                    false,
                )
                .unwrap();
        }
        if let Some(until) = &piece.expect_content_until {
            target.set_streaming_known_state(until);
        }
    }

    #[test]
    fn test_append_updates_known_state() {
        let writer = Writer::new(1);
        let mut state = new_state(LogConfig::default());
        for i in 0..3 {
            state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(i, 1));
        }
        assert_eq!(state.known_state().count(&writer.session), 3);
        assert!(state.known_state().header);
        state
            .verify_checkpoints(&StandardCrypto, &writer.session, &writer.secret.signer_id())
            .unwrap();
    }

    #[test]
    fn test_rejects_forged_signature() {
        let writer = Writer::new(1);
        let forger = Writer::new(2);
        let mut source = new_state(LogConfig::default());
        source.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));

        let mut target = replica_of(&source);
        let txs = source.session(&writer.session).unwrap().transactions().to_vec();
        let forged = forger.secret.sign(source.session(&writer.session).unwrap().last_hash().as_bytes());

        let result = target.try_add_transactions(
            &StandardCrypto,
            writer.session,
            Some(&writer.secret.signer_id()),
            &txs,
            None,
            forged,
            false,
        );
        assert_eq!(result, Err(TryAddTransactionsError::InvalidSignature));
        assert!(target.known_state().sessions.is_empty());
    }

    #[test]
    fn test_rejects_wrong_expected_hash() {
        let writer = Writer::new(1);
        let mut source = new_state(LogConfig::default());
        let sig =
            source.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));
        let txs = source.session(&writer.session).unwrap().transactions().to_vec();

        let mut target = replica_of(&source);
        let result = target.try_add_transactions(
            &StandardCrypto,
            writer.session,
            Some(&writer.secret.signer_id()),
            &txs,
            Some(&Blake3Hash::ZERO),
            sig,
            false,
        );
        assert!(matches!(result, Err(TryAddTransactionsError::InvalidHash { .. })));
        assert_eq!(target.transaction_count(&writer.session), 0);
    }

    #[test]
    fn test_missing_signer_is_invalid_unless_skipped() {
        let writer = Writer::new(1);
        let mut source = new_state(LogConfig::default());
        let sig =
            source.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));
        let txs = source.session(&writer.session).unwrap().transactions().to_vec();

        let mut target = replica_of(&source);
        assert_eq!(
            target.try_add_transactions(&StandardCrypto, writer.session, None, &txs, None, sig, false),
            Err(TryAddTransactionsError::InvalidSignature)
        );
        target
            .try_add_transactions(&StandardCrypto, writer.session, None, &txs, None, sig, true)
            .unwrap();
        assert_eq!(target.transaction_count(&writer.session), 1);
    }

    #[test]
    fn test_checkpoint_recorded_after_threshold() {
        let writer = Writer::new(1);
        let mut state = new_state(LogConfig::default().with_checkpoint_threshold(100));
        for i in 0..10 {
            state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(i, 60));
        }
        let log = state.session(&writer.session).unwrap();
        assert!(!log.signature_after().is_empty());
        state
            .verify_checkpoints(&StandardCrypto, &writer.session, &writer.secret.signer_id())
            .unwrap();
    }

    #[test]
    fn test_content_since_nothing_includes_header() {
        let writer = Writer::new(1);
        let mut state = new_state(LogConfig::default());
        state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));

        let pieces = state.new_content_since(None).unwrap();
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].header.is_some());
        assert_eq!(pieces[0].new[&writer.session].after, 0);
        assert_eq!(pieces[0].new[&writer.session].new_transactions.len(), 1);
        assert!(pieces[0].expect_content_until.is_none());
    }

    #[test]
    fn test_content_since_up_to_date_is_none() {
        let writer = Writer::new(1);
        let mut state = new_state(LogConfig::default());
        state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));
        let known = state.known_state().clone();
        assert!(state.new_content_since(Some(&known)).is_none());
    }

    #[test]
    fn test_cached_empty_content_invalidated_on_append() {
        let writer = Writer::new(1);
        let mut state = new_state(LogConfig::default());
        state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));
        assert_eq!(state.new_content_since(None).unwrap()[0].transaction_count(), 1);
        state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(1, 1));
        assert_eq!(state.new_content_since(None).unwrap()[0].transaction_count(), 2);
    }

    #[test]
    fn test_chunking_splits_at_checkpoints() {
        let writer = Writer::new(1);
        let config = LogConfig::default()
            .with_checkpoint_threshold(200)
            .with_max_piece_size(300);
        let mut state = new_state(config);
        for i in 0..20 {
            state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(i, 100));
        }

        let pieces = state.new_content_since(None).unwrap();
        assert!(pieces.len() > 1);
        assert_eq!(
            pieces[0].expect_content_until.as_ref(),
            Some(&state.known_state().sessions)
        );
        let log = state.session(&writer.session).unwrap();
        for piece in &pieces[..pieces.len() - 1] {
            let content = &piece.new[&writer.session];
            let last_idx = content.end() - 1;
            assert_eq!(log.signature_after().get(&last_idx), Some(&content.last_signature));
        }
    }

    #[test]
    fn test_streaming_completes_on_last_piece() {
        let writer = Writer::new(1);
        let config = LogConfig::default()
            .with_checkpoint_threshold(200)
            .with_max_piece_size(300);
        let mut source = new_state(config);
        for i in 0..20 {
            source.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(i, 100));
        }
        let pieces = source.new_content_since(None).unwrap();
        assert!(pieces.len() >= 2);

        let mut target = replica_of(&source);
        let (last, init) = pieces.split_last().unwrap();
        for piece in init {
            apply(&mut target, piece, &writer);
        }
        assert!(target.is_streaming());
        assert_eq!(
            target.known_state_with_streaming().sessions,
            source.known_state().sessions
        );

        apply(&mut target, last, &writer);
        assert!(!target.is_streaming());
        assert_eq!(target.known_state(), source.known_state());
    }

    #[test]
    fn test_diff_from_partial_state() {
        let a = Writer::new(1);
        let b = Writer::new(2);
        let mut source = new_state(LogConfig::default());
        for i in 0..3 {
            source.add_local_transaction(&StandardCrypto, a.session, &a.secret, tx(i, 1));
        }
        let mut target = replica_of(&source);
        apply(&mut target, &source.new_content_since(None).unwrap()[0], &a);

        for i in 3..5 {
            source.add_local_transaction(&StandardCrypto, a.session, &a.secret, tx(i, 1));
        }
        source.add_local_transaction(&StandardCrypto, b.session, &b.secret, tx(9, 1));

        let pieces = source.new_content_since(Some(target.known_state())).unwrap();
        assert!(pieces[0].header.is_none());
        assert_eq!(pieces[0].new[&a.session].after, 3);
        assert_eq!(pieces[0].new[&b.session].after, 0);
    }

    #[test]
    fn test_streaming_ceiling_ignored_when_already_covered() {
        let writer = Writer::new(1);
        let mut state = new_state(LogConfig::default());
        state.add_local_transaction(&StandardCrypto, writer.session, &writer.secret, tx(0, 1));
        let covered = state.known_state().sessions.clone();
        state.set_streaming_known_state(&covered);
        assert!(!state.is_streaming());
    }

    mod properties {
        use super::{new_state, replica_of, tx, Writer};
        use crate::config::LogConfig;
        use crate::content::ContentPiece;
        use crate::crypto::{CryptoProvider, StandardCrypto};
        use crate::known_state::SessionCounts;
        use crate::verified_state::VerifiedState;
        use proptest::prelude::*;

        fn build(sizes: &[usize], writers: &[Writer], config: LogConfig) -> VerifiedState {
            let mut state = new_state(config);
            for (i, size) in sizes.iter().enumerate() {
                let w = &writers[i % writers.len()];
                state.add_local_transaction(&StandardCrypto, w.session, &w.secret, tx(i, *size));
            }
            state
        }

        fn copy_prefix(source: &VerifiedState, counts: &SessionCounts, writers: &[Writer]) -> VerifiedState {
            let mut target = replica_of(source);
            for w in writers {
                let n = counts.get(&w.session).copied().unwrap_or(0) as usize;
                if n == 0 {
                    continue;
                }
                let log = source.session(&w.session).unwrap();
                let txs = &log.transactions()[..n];
                let mut rolling = StandardCrypto.rolling_hash();
                for t in txs {
                    rolling.update(&t.encoded());
                }
                let sig = w.secret.sign(rolling.digest().as_bytes());
                target
                    .try_add_transactions(&StandardCrypto, w.session, Some(&w.secret.signer_id()), txs, None, sig, false)
                    .unwrap();
            }
            target
        }

        fn apply_all(target: &mut VerifiedState, pieces: &[ContentPiece], writers: &[Writer]) {
            for piece in pieces {
                for (session, content) in &piece.new {
                    let have = target.transaction_count(session);
                    if content.after > have {
                        continue;
                    }
                    let skip = (have - content.after) as usize;
                    if skip >= content.new_transactions.len() {
                        continue;
                    }
                    let w = writers.iter().find(|w| &w.session == session).unwrap();
                    target
                        .try_add_transactions(
                            &StandardCrypto,
                            *session,
                            Some(&w.secret.signer_id()),
                            &content.new_transactions[skip..],
                            None,
                            content.last_signature,
                            false,
                        )
                        .unwrap();
                }
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_append_counts_and_checkpoints(sizes in prop::collection::vec(1usize..200, 1..40)) {
                let writers = [Writer::new(1), Writer::new(2)];
                let state = build(&sizes, &writers, LogConfig::default().with_checkpoint_threshold(250));
                let total: u32 = writers.iter().map(|w| state.known_state().count(&w.session)).sum();
                prop_assert_eq!(total as usize, sizes.len());
                for w in &writers {
                    prop_assert!(state.verify_checkpoints(&StandardCrypto, &w.session, &w.secret.signer_id()).is_ok());
                }
            }

            #[test]
            fn prop_diff_roundtrip(
                sizes in prop::collection::vec(1usize..200, 1..40),
                cut in 0usize..40,
            ) {
                let writers = [Writer::new(1), Writer::new(2), Writer::new(3)];
                let config = LogConfig::default().with_checkpoint_threshold(300).with_max_piece_size(500);
                let full = build(&sizes, &writers, config);
                let partial = build(&sizes[..cut.min(sizes.len())], &writers, config);
                let mut replica = copy_prefix(&full, &partial.known_state().sessions, &writers);

                let known = replica.known_state().clone();
                if let Some(pieces) = full.new_content_since(Some(&known)) {
                    apply_all(&mut replica, &pieces, &writers);
                }
                prop_assert_eq!(&replica.known_state().sessions, &full.known_state().sessions);
            }

            #[test]
            fn prop_reapply_is_idempotent(sizes in prop::collection::vec(1usize..200, 1..30)) {
                let writers = [Writer::new(1), Writer::new(2)];
                let config = LogConfig::default().with_checkpoint_threshold(300).with_max_piece_size(500);
                let source = build(&sizes, &writers, config);
                let pieces = source.new_content_since(None).unwrap();

                let mut replica = replica_of(&source);
                apply_all(&mut replica, &pieces, &writers);
                let once = replica.known_state().clone();
                apply_all(&mut replica, &pieces, &writers);
                apply_all(&mut replica, &pieces[..1], &writers);
                prop_assert_eq!(replica.known_state(), &once);
                prop_assert_eq!(&once.sessions, &source.known_state().sessions);
            }
        }
    }
}
