//! Known state: the compact per-session progress vector.
//!
//! A known state is both a diff cursor ("send me what comes after this") and
//! an acknowledgement ("I have at least this much").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{CoValueId, SessionId};

/// Session id → number of transactions.
pub type SessionCounts = BTreeMap<SessionId, u32>;

/// What one participant has of one CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: CoValueId,
    pub header: bool,
    pub sessions: SessionCounts,
}

impl KnownState {
    /// Nothing known: no header, no sessions.
    pub fn empty(id: CoValueId) -> Self {
        Self {
            id,
            header: false,
            sessions: SessionCounts::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.header && self.sessions.is_empty()
    }

    /// Count for one session (0 if unknown).
    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Raise the count of a session, never lowering it.
    pub fn raise(&mut self, session: SessionId, count: u32) {
        let entry = self.sessions.entry(session).or_insert(0);
        *entry = (*entry).max(count);
    }

    /// Merge another state in, max-wise per session.
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        combine_counts(&mut self.sessions, &other.sessions);
    }

    /// True if `self` has at least everything `other` has.
    pub fn covers(&self, other: &KnownState) -> bool {
        (self.header || !other.header) && counts_cover(&self.sessions, &other.sessions)
    }
}

/// Max-wise merge of session counts.
pub fn combine_counts(into: &mut SessionCounts, other: &SessionCounts) {
    for (session, count) in other {
        let entry = into.entry(*session).or_insert(0);
        *entry = (*entry).max(*count);
    }
}

/// True if every session in `other` is matched or exceeded in `ours`.
pub fn counts_cover(ours: &SessionCounts, other: &SessionCounts) -> bool {
    other
        .iter()
        .all(|(session, count)| ours.get(session).copied().unwrap_or(0) >= *count)
}
