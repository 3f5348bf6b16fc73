//! Error types for CoValue core operations.

use thiserror::Error;

use crate::ids::CoValueId;

/// General errors from encoding, identity checks, and payload handling.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("header does not hash to {expected}: got {actual}")]
    IdMismatch {
        expected: CoValueId,
        actual: CoValueId,
    },

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// A session's author could not be mapped to a signer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveAccountAgentError {
    #[error("account {0} is not loaded")]
    AccountNotLoaded(CoValueId),

    #[error("account {0} does not declare a signer")]
    NoSigner(CoValueId),
}

/// Outcome of a rejected append.
///
/// Integrity failures are returned as values; they reject the batch and never
/// tear down the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TryAddTransactionsError {
    #[error("rolling hash mismatch: expected {expected}, computed {actual}")]
    InvalidHash { expected: String, actual: String },

    #[error("signature does not verify against rolling hash")]
    InvalidSignature,

    #[error("no verified state for {0}: header was never provided")]
    TriedToAddTransactionsWithoutVerifiedState(CoValueId),

    #[error(transparent)]
    ResolveAccountAgent(#[from] ResolveAccountAgentError),
}

impl TryAddTransactionsError {
    /// True for failures that are retried once a dependency shows up.
    pub fn is_deferred(&self) -> bool {
        matches!(self, TryAddTransactionsError::ResolveAccountAgent(_))
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
