//! Error types for permission evaluation and key distribution.

use thiserror::Error;

use covalue_core::KeyId;

#[derive(Debug, Error)]
pub enum PermsError {
    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("read key not found: {0}")]
    KeyNotFound(KeyId),

    #[error("invalid role change: {0}")]
    InvalidRoleChange(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("core error: {0}")]
    Core(#[from] covalue_core::CoreError),
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
