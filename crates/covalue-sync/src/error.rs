//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Encoded message exceeds the wire limit.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(String),

    /// Timeout waiting for peers or storage.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Storage operation failed.
    #[error("store error: {0}")]
    Store(#[from] covalue_store::StoreError),

    #[error("core error: {0}")]
    Core(#[from] covalue_core::CoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
