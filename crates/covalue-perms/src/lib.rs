//! # CoValue Permissions
//!
//! Group roles, permission evaluation and read-key distribution.
//!
//! ## Overview
//!
//! Permissions are never stored as flags. A group is a map CoValue whose
//! entries assign roles to members; the role a member holds at any moment is
//! recovered by replaying the group's valid transactions. A CoValue owned by
//! a group accepts a transaction iff its author could write to the group at
//! the transaction's `madeAt`.
//!
//! ## Key Concepts
//!
//! - **Role**: `admin`, `writer`, `reader` or `revoked`
//! - **RoleTimeline**: role history of one group, queryable at any time
//! - **GroupRulesEvaluator**: the [`PermissionEvaluator`] plugged into the core
//! - **SealedKey**: a read key encrypted for one member's X25519 key
//!
//! ## Encryption Model
//!
//! Private transactions are encrypted under a group read key
//! (ChaCha20-Poly1305). Admins distribute read keys by writing
//! [`SealedKey`]s into the group map, one per recipient, each wrapped with an
//! ephemeral X25519 agreement. Rotating a key only needs new sealed entries.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::{Arc, RwLock};
//! use covalue_core::CoValueRegistry;
//! use covalue_perms::{GroupRulesEvaluator, KeyRing, X25519StaticSecret};
//!
//! let keyring = Arc::new(RwLock::new(KeyRing::new()));
//! let evaluator = GroupRulesEvaluator::new(keyring).with_sealer(X25519StaticSecret::generate());
//! let registry = CoValueRegistry::default().with_evaluator(Box::new(evaluator));
//! ```
//!
//! [`PermissionEvaluator`]: covalue_core::PermissionEvaluator

pub mod crypto;
pub mod error;
pub mod evaluator;
pub mod keyring;
pub mod roles;

pub use crypto::{EphemeralKeyPair, SealNonce, SharedKey, X25519PublicKey, X25519StaticSecret};
pub use error::{PermsError, Result};
pub use evaluator::GroupRulesEvaluator;
pub use keyring::{KeyRing, SealedKey};
pub use roles::{role_changes, Role, RoleTimeline};
