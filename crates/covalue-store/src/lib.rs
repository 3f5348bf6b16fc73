//! # CoValue Store
//!
//! Storage abstraction for CoValue content. Provides a trait-based interface
//! for content persistence with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The sync layer persists every piece of content it accepts through the
//! [`Storage`] trait and asks it first when a CoValue is loaded. The primary
//! implementation is [`SqliteStorage`], with [`MemoryStorage`] for testing.
//!
//! ## Key Types
//!
//! - [`Storage`] - The trait for all storage operations
//! - [`SqliteStorage`] - SQLite-based persistent storage
//! - [`MemoryStorage`] - In-memory storage for tests
//! - [`StoreOutcome`] - Result of storing content pieces
//!
//! ## Usage
//!
//! ```rust,no_run
//! use covalue_store::{SqliteStorage, Storage, StorageExt};
//! use covalue_core::CoValueId;
//!
//! let storage = SqliteStorage::open("covalues.db").unwrap();
//! let id = CoValueId::from_bytes([0; 32]);
//! if let Some(pieces) = storage.load_all(&id).unwrap() {
//!     println!("{} pieces", pieces.len());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent stores**: Storing content already held is a no-op
//! - **Corrections**: A piece that would leave a gap is refused with the
//!   stored known state, so the sender can resend from there
//! - **Checkpoints**: Loads return pieces split where they were stored

pub mod error;
pub mod memory;
pub mod migration;
pub mod record;
pub mod sqlite;
pub mod traits;

#[cfg(test)]
mod fixtures;

pub use error::{Result, StoreError};
pub use memory::MemoryStorage;
pub use record::{StoredCoValue, StoredSession};
pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageExt, StoreOutcome};
