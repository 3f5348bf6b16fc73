//! Shared test data for the storage backends.

use serde_json::json;

use covalue_core::{
    list_append, Author, CoValueHeader, CoValueType, CryptoProvider, LogConfig, Ruleset,
    SessionId, SignerSecret, StandardCrypto, Transaction, VerifiedState,
};

/// A list with `count` appends by one writer, checkpointed every couple of
/// transactions so that content comes in several pieces.
pub(crate) fn sample_log(count: usize) -> VerifiedState {
    let secret = SignerSecret::from_seed(&[7; 32]);
    let session = SessionId::new(Author::Agent(secret.signer_id()), [1; 8]);
    let header = CoValueHeader::new(CoValueType::List, Ruleset::UnsafeAllowAll)
        .with_uniqueness("store-tests");
    let id = StandardCrypto.covalue_id(&header);
    let config = LogConfig::default()
        .with_checkpoint_threshold(64)
        .with_max_piece_size(64);

    let mut log = VerifiedState::new(id, header, config);
    for i in 0..count {
        let tx = Transaction::trusting(&[list_append(json!(format!("item {i}")))], None, i as i64)
            .expect("trusting transaction");
        log.add_local_transaction(&StandardCrypto, session, &secret, tx);
    }
    log
}

/// The single session of a [`sample_log`].
pub(crate) fn session_of(log: &VerifiedState) -> SessionId {
    let secret = SignerSecret::from_seed(&[7; 32]);
    let session = SessionId::new(Author::Agent(secret.signer_id()), [1; 8]);
    debug_assert!(log.session(&session).is_some() || log.known_state().sessions.is_empty());
    session
}
