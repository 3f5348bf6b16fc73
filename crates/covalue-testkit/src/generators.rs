//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::Value;

use covalue::core::{
    list_append, map_set, Author, CoValueHeader, CoValueId, CoValueType, CryptoProvider,
    KnownState, LogConfig, Ruleset, SessionId, SignerId, SignerSecret, StandardCrypto,
    Transaction, VerifiedState,
};

/// Generate a random signer secret.
pub fn signer_secret() -> impl Strategy<Value = SignerSecret> {
    any::<[u8; 32]>().prop_map(|seed| SignerSecret::from_seed(&seed))
}

/// Generate a random CoValueId.
pub fn covalue_id() -> impl Strategy<Value = CoValueId> {
    any::<[u8; 32]>().prop_map(CoValueId::from_bytes)
}

/// Generate an agent session.
pub fn session_id() -> impl Strategy<Value = SessionId> {
    (signer_secret(), any::<[u8; 8]>())
        .prop_map(|(secret, tag)| SessionId::new(Author::Agent(secret.signer_id()), tag))
}

/// Generate a scalar JSON value.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// Generate a map `set` change on a short key.
pub fn map_change() -> impl Strategy<Value = Value> {
    ("[a-z]{1,6}", json_scalar()).prop_map(|(key, value)| map_set(&key, value))
}

/// Generate a list `append` change.
pub fn list_change() -> impl Strategy<Value = Value> {
    json_scalar().prop_map(list_append)
}

/// Generate the changes of one transaction.
pub fn changes(max_len: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(map_change(), 1..=max_len.max(1))
}

/// Parameters for generating a map log written by several agents.
#[derive(Debug, Clone)]
pub struct LogParams {
    /// One seed per writer; each writer gets one session.
    pub writers: Vec<[u8; 32]>,
    /// Transactions in append order, as (writer index, changes).
    pub transactions: Vec<(usize, Vec<Value>)>,
}

impl LogParams {
    /// `count` single-change transactions spread round robin over `writers`.
    pub fn sequential(writers: usize, count: usize) -> Self {
        let writers = writers.max(1);
        Self {
            writers: (0..writers).map(|i| [i as u8 + 1; 32]).collect(),
            transactions: (0..count)
                .map(|n| (n % writers, vec![map_set(&format!("k{}", n % 16), Value::from(n))]))
                .collect(),
        }
    }

    pub fn secret(&self, writer: usize) -> SignerSecret {
        SignerSecret::from_seed(&self.writers[writer])
    }

    pub fn session(&self, writer: usize) -> SessionId {
        SessionId::new(Author::Agent(self.secret(writer).signer_id()), [writer as u8; 8])
    }

    /// Signer of every session in this log.
    pub fn signer_of(&self, session: &SessionId) -> Option<SignerId> {
        match session.author() {
            Author::Agent(signer) => Some(*signer),
            Author::Account(_) => None,
        }
    }

    /// Expected known state of the generated log.
    pub fn expected_known_state(&self, id: CoValueId) -> KnownState {
        let mut known = KnownState::empty(id);
        known.header = true;
        for (writer, _) in &self.transactions {
            let session = self.session(*writer);
            let count = known.count(&session);
            known.raise(session, count + 1);
        }
        known
    }
}

impl Arbitrary for LogParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (1usize..=3)
            .prop_flat_map(|writers| {
                (
                    prop::collection::vec(any::<[u8; 32]>(), writers),
                    prop::collection::vec((0..writers, changes(4)), 0..40),
                )
            })
            .prop_map(|(writers, transactions)| LogParams {
                writers,
                transactions,
            })
            .boxed()
    }
}

/// Header shared by every generated log.
pub fn log_header() -> CoValueHeader {
    CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll)
        .with_uniqueness("generated-log")
        .with_created_at(0)
}

/// Build a signed log from parameters.
pub fn log_from_params(params: &LogParams) -> VerifiedState {
    log_with_config(params, LogConfig::default())
}

/// Build a signed log with explicit checkpoint and piece limits.
pub fn log_with_config(params: &LogParams, config: LogConfig) -> VerifiedState {
    let crypto = StandardCrypto;
    let header = log_header();
    let id = crypto.covalue_id(&header);
    let mut log = VerifiedState::new(id, header, config);
    for (n, (writer, changes)) in params.transactions.iter().enumerate() {
        // Changes are JSON values already, encoding cannot fail.
        let Ok(tx) = Transaction::trusting(changes, None, n as i64) else {
            continue;
        };
        log.add_local_transaction(&crypto, params.session(*writer), &params.secret(*writer), tx);
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(
        params: &LogParams,
        source: &VerifiedState,
        since: Option<&KnownState>,
        into: &mut VerifiedState,
    ) {
        for piece in source.new_content_since(since).unwrap_or_default() {
            for (session, content) in &piece.new {
                into.try_add_transactions(
                    &StandardCrypto,
                    *session,
                    params.signer_of(session).as_ref(),
                    &content.new_transactions,
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
        fn prop_generated_log_counts(params: LogParams) {
            let log = log_from_params(&params);
            prop_assert_eq!(log.known_state(), &params.expected_known_state(*log.id()));
        }

        #[test]
        fn prop_full_content_rebuilds_log(params: LogParams) {
            let source = log_from_params(&params);
            let mut replica = VerifiedState::new(*source.id(), log_header(), LogConfig::default());
            replay(&params, &source, None, &mut replica);
            prop_assert_eq!(replica.known_state(), source.known_state());
        }

        #[test]
        fn prop_diff_from_prefix_completes_replica(params in any::<LogParams>(), cut in 0usize..40) {
            let cut = cut.min(params.transactions.len());
            let prefix = LogParams {
                writers: params.writers.clone(),
                transactions: params.transactions[..cut].to_vec(),
            };
            let source = log_from_params(&params);
            let mut replica = log_from_params(&prefix);
            let since = replica.known_state().clone();
            replay(&params, &source, Some(&since), &mut replica);
            prop_assert_eq!(replica.known_state(), source.known_state());
        }
    }

    #[test]
    fn test_sequential_params() {
        let params = LogParams::sequential(2, 5);
        let known = params.expected_known_state(CoValueId::from_bytes([0; 32]));
        assert_eq!(known.count(&params.session(0)), 3);
        assert_eq!(known.count(&params.session(1)), 2);
    }
}
