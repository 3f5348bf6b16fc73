//! In-memory implementation of the Storage trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::trace;

use covalue_core::{CoValueId, ContentPiece, KnownState};

use crate::error::{Result, StoreError};
use crate::record::{fit, Fit, StoredCoValue};
use crate::traits::{Storage, StoreOutcome};

/// In-memory storage.
///
/// All data is lost when the storage is dropped. Thread-safe via RwLock.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<HashMap<CoValueId, StoredCoValue>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map_or(0, |inner| inner.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<CoValueId, StoredCoValue>>> {
        self.inner.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<CoValueId, StoredCoValue>>> {
        self.inner.write().map_err(|_| StoreError::LockPoisoned)
    }
}

impl Storage for MemoryStorage {
    fn load(&self, id: &CoValueId, on_chunk: &mut dyn FnMut(ContentPiece)) -> Result<bool> {
        // Copy out before calling back so the callback may use the storage.
        let pieces = match self.read()?.get(id) {
            Some(stored) => stored.pieces(),
            None => return Ok(false),
        };
        for piece in pieces {
            on_chunk(piece);
        }
        Ok(true)
    }

    fn store(&self, pieces: &[ContentPiece]) -> Result<StoreOutcome> {
        let mut inner = self.write()?;

        for piece in pieces {
            let existing = inner.get(&piece.id);
            let fits = fit(piece, existing.is_some(), |session| {
                existing.map_or(0, |stored| stored.count(session))
            });
            match fits {
                Fit::Continues => {}
                Fit::MissingHeader => {
                    trace!(id = %piece.id, "piece without header for unknown CoValue");
                    return Ok(StoreOutcome::CorrectionNeeded(KnownState::empty(piece.id)));
                }
                Fit::Gap => {
                    let known = existing
                        .map(StoredCoValue::known_state)
                        .unwrap_or_else(|| KnownState::empty(piece.id));
                    trace!(id = %piece.id, "gap in stored sessions");
                    return Ok(StoreOutcome::CorrectionNeeded(known));
                }
            }

            let stored = match &piece.header {
                Some(header) => inner
                    .entry(piece.id)
                    .or_insert_with(|| StoredCoValue::new(piece.id, header.clone())),
                None => match inner.get_mut(&piece.id) {
                    Some(stored) => stored,
                    None => continue,
                },
            };
            for (session, content) in &piece.new {
                stored.append(*session, content);
            }
        }
        Ok(StoreOutcome::Stored)
    }

    fn known_state(&self, id: &CoValueId) -> Result<Option<KnownState>> {
        Ok(self.read()?.get(id).map(StoredCoValue::known_state))
    }

    fn ids(&self) -> Result<Vec<CoValueId>> {
        let mut ids: Vec<CoValueId> = self.read()?.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
