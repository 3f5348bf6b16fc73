//! Log store configuration.

/// Default payload bytes between checkpoint signatures, and per content piece.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Tuning for session logs and content chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogConfig {
    /// Payload bytes after which a checkpoint signature is recorded.
    pub checkpoint_threshold: usize,
    /// Payload bytes after which a content piece is sealed.
    pub max_piece_size: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            checkpoint_threshold: MAX_RECOMMENDED_TX_SIZE,
            max_piece_size: MAX_RECOMMENDED_TX_SIZE,
        }
    }
}

impl LogConfig {
    pub fn with_checkpoint_threshold(mut self, bytes: usize) -> Self {
        self.checkpoint_threshold = bytes;
        self
    }

    pub fn with_max_piece_size(mut self, bytes: usize) -> Self {
        self.max_piece_size = bytes;
        self
    }
}
