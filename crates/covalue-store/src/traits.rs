//! Storage trait: the interface the sync layer persists through.
//!
//! The sync core treats storage as one more participant with a known state.
//! It is called synchronously from the single handler, so implementations
//! must not block on anything but their own I/O.

use covalue_core::{CoValueId, ContentPiece, KnownState};

use crate::error::Result;

/// Result of storing content pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Every piece was stored (overlapping parts are skipped).
    Stored,
    /// A piece did not continue what is stored. Nothing from that piece on
    /// was written; the caller should resend from this state.
    CorrectionNeeded(KnownState),
}

/// Persistent content store.
///
/// # Design Notes
///
/// - **Idempotent stores**: re-storing content already held is a no-op.
/// - **Gap detection**: a piece whose `after` exceeds the stored count of a
///   session, or that lacks a header for an unknown CoValue, yields
///   [`StoreOutcome::CorrectionNeeded`] with the stored known state.
/// - **Checkpoints**: the end of every stored session slice is a checkpoint;
///   [`Storage::load`] returns pieces split at those boundaries.
pub trait Storage: Send + Sync {
    /// Stream the stored content of `id` to `on_chunk`, header first.
    ///
    /// Returns `false` if nothing is stored for `id`.
    fn load(&self, id: &CoValueId, on_chunk: &mut dyn FnMut(ContentPiece)) -> Result<bool>;

    /// Store pieces in order.
    fn store(&self, pieces: &[ContentPiece]) -> Result<StoreOutcome>;

    /// What is stored for `id`, if anything.
    fn known_state(&self, id: &CoValueId) -> Result<Option<KnownState>>;

    /// Every stored CoValue id.
    fn ids(&self) -> Result<Vec<CoValueId>>;

    /// True once storage holds at least `known`.
    fn is_synced(&self, known: &KnownState) -> Result<bool> {
        Ok(self
            .known_state(&known.id)?
            .is_some_and(|stored| stored.covers(known)))
    }
}

/// Extension trait for common storage patterns.
pub trait StorageExt: Storage {
    /// Collect every stored piece of `id`.
    fn load_all(&self, id: &CoValueId) -> Result<Option<Vec<ContentPiece>>> {
        let mut pieces = Vec::new();
        let found = self.load(id, &mut |piece| pieces.push(piece))?;
        Ok(found.then_some(pieces))
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
