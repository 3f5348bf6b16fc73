//! # CoValue
//!
//! The unified API for CoValues: signed, append-only, multi-writer logs that
//! replicate between peers and materialize into maps, lists and streams.
//!
//! ## Overview
//!
//! A [`LocalNode`] is one participant. It provides:
//!
//! - **Creation**: CoValues, accounts and groups, addressed by header hash
//! - **Writes**: trusting or private transactions under the node's session
//! - **Permissions**: group roles and sealed read keys
//! - **Branches**: branch a CoValue, work on it, merge it back
//! - **Sync**: every write is persisted and pushed to peers as it happens
//!
//! ## Key Concepts
//!
//! - **Session**: one writer's append-only log inside a CoValue.
//! - **Known state**: per-session transaction counts, the unit peers compare.
//! - **Dependency**: a CoValue whose availability gates another's validity
//!   (its owning group, its branch source, an author's account).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue::{LocalNode, NodeConfig, Privacy};
//! use covalue::core::{map_set, CoValueType, Ruleset, SignerSecret};
//!
//! fn example() -> covalue::Result<()> {
//!     let mut node = LocalNode::with_group_rules(
//!         SignerSecret::generate(),
//!         None,
//!         NodeConfig::default(),
//!     );
//!     let group = node.create_group()?;
//!     let doc = node.create_covalue(CoValueType::Map, Ruleset::OwnedByGroup { group }, None)?;
//!     node.make_transaction(&doc, &[map_set("hello", "world".into())], Privacy::Private)?;
//!     Ok(())
//! }
//! ```
//!
//! To run a node against peers, hand it to a
//! [`SyncDriver`](covalue_sync::SyncDriver) together with a transport.
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `covalue::core` - Log store, loading machine, pipeline and views
//! - `covalue::store` - Storage abstraction and SQLite
//! - `covalue::sync` - Sync protocol, peer state and driver
//! - `covalue::perms` - Group roles and read keys

pub mod config;
pub mod error;
pub mod node;

// Re-export component crates
pub use covalue_core as core;
pub use covalue_perms as perms;
pub use covalue_store as store;
pub use covalue_sync as sync;

// Re-export main types for convenience
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::{LocalNode, Privacy};

// Re-export commonly used types
pub use covalue_core::{
    AggregateState, Author, CoValueHeader, CoValueId, CoValueType, ContentView, KnownState,
    PeerId, Ruleset, SessionId, SignerSecret,
};
pub use covalue_perms::Role;
pub use covalue_sync::{PeerRole, SyncConfig, SyncDriver};
