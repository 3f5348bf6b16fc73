//! # CoValue Core
//!
//! Replicated log primitives: content-addressed headers, signed per-session
//! transaction logs, known state, and the per-CoValue dependency and loading
//! machinery.
//!
//! This crate does no I/O. Storage and networking plug in from
//! `covalue-store` and `covalue-sync`; permission rules from
//! `covalue-perms`.
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] / [`CoValueId`] - the immutable header and its hash
//! - [`VerifiedState`] - the Log Store, with rolling hashes and checkpoints
//! - [`KnownState`] - per-session counts, used as diff cursor and ack
//! - [`ContentPiece`] - one verifiable chunk of a diff
//! - [`CoValueCore`] - loading state, dependencies, listeners
//! - [`CoValueRegistry`] - every CoValue of a node plus shared collaborators
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See the
//! [`canonical`] module.

pub mod branch;
pub mod canonical;
pub mod config;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod permissions;
pub mod pipeline;
pub mod registry;
pub mod transaction;
pub mod verified_state;
pub mod view;

pub use branch::{BranchPointer, BranchState, MergeCommit, MergedOrigin, MetaRecord};
pub use canonical::{canonical_header_bytes, canonical_transaction_bytes};
pub use config::{LogConfig, MAX_RECOMMENDED_TX_SIZE};
pub use content::{ContentPiece, SessionNewContent};
pub use covalue::{
    AggregateState, CoValueCore, Listener, ListenerId, LoadSource, LoadingStatus, Unsubscribe,
};
pub use crypto::{
    Blake3Hash, CryptoProvider, KeyId, KeySecret, NonceMaterial, RollingHash, Signature,
    SignerId, SignerSecret, StandardCrypto,
};
pub use error::{CoreError, ResolveAccountAgentError, Result, TryAddTransactionsError};
pub use header::{CoValueHeader, CoValueType, Priority, Ruleset};
pub use ids::{Author, CoValueId, PeerId, SessionId, TransactionId};
pub use known_state::{combine_counts, counts_cover, KnownState, SessionCounts};
pub use permissions::{
    AccountResolver, AllowAll, HeaderAccountResolver, PermissionEvaluator, ValidationContext,
};
pub use pipeline::{TransactionPipeline, Validity, VerifiedTransaction};
pub use registry::CoValueRegistry;
pub use transaction::{decrypt_private, Transaction};
pub use verified_state::{SessionLog, VerifiedState};
pub use view::{list_append, map_del, map_set, ContentView, ListView, MapEntry, MapView, StreamView};
