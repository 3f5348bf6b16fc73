//! Error types for node operations.

use covalue_core::{CoValueId, CoreError, TryAddTransactionsError};
use covalue_perms::PermsError;
use covalue_store::StoreError;
use covalue_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("append rejected: {0}")]
    Append(#[from] TryAddTransactionsError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("permission error: {0}")]
    Permission(#[from] PermsError),

    /// The CoValue has no header on this node.
    #[error("covalue not available: {0}")]
    NotAvailable(CoValueId),

    #[error("not a branch: {0}")]
    NotABranch(CoValueId),

    #[error("not a group: {0}")]
    NotAGroup(CoValueId),

    /// No current read key for the group a private write would use.
    #[error("no read key for group {0}")]
    NoReadKey(CoValueId),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
