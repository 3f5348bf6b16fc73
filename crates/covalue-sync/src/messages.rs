//! Sync protocol message types.
//!
//! Four symmetric messages, tagged by `action` on the wire with camelCase
//! field names.

use serde::{Deserialize, Serialize};

use covalue_core::{CoValueId, ContentPiece, KnownState, Priority, SessionCounts};

/// Message size limits.
pub mod limits {
    /// Max encoded size of one message.
    pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
    /// Max sessions named by one message.
    pub const MAX_SESSIONS_PER_MESSAGE: usize = 10_000;
}

/// Ask a peer for a CoValue, stating what we already have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMessage {
    pub id: CoValueId,
    pub header: bool,
    pub sessions: SessionCounts,
}

impl LoadMessage {
    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: self.header,
            sessions: self.sessions.clone(),
        }
    }
}

impl From<&KnownState> for LoadMessage {
    fn from(known: &KnownState) -> Self {
        Self {
            id: known.id,
            header: known.header,
            sessions: known.sessions.clone(),
        }
    }
}

/// Tell a peer what we have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownMessage {
    pub id: CoValueId,
    pub header: bool,
    pub sessions: SessionCounts,
    /// Replaces, rather than extends, what the receiver assumes we have.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_correction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_dependency_of: Option<CoValueId>,
}

impl KnownMessage {
    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: self.header,
            sessions: self.sessions.clone(),
        }
    }

    /// A correction carrying `known` verbatim.
    pub fn correction(known: &KnownState) -> Self {
        Self {
            is_correction: true,
            ..Self::from(known)
        }
    }

    pub fn with_dependant(mut self, dependant: CoValueId) -> Self {
        self.as_dependency_of = Some(dependant);
        self
    }
}

impl From<&KnownState> for KnownMessage {
    fn from(known: &KnownState) -> Self {
        Self {
            id: known.id,
            header: known.header,
            sessions: known.sessions.clone(),
            is_correction: false,
            as_dependency_of: None,
        }
    }
}

/// Terminal marker, reserved for flow signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMessage {
    pub id: CoValueId,
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SyncMessage {
    Load(LoadMessage),
    Known(KnownMessage),
    Content(ContentPiece),
    Done(DoneMessage),
}

impl SyncMessage {
    pub fn id(&self) -> &CoValueId {
        match self {
            SyncMessage::Load(m) => &m.id,
            SyncMessage::Known(m) => &m.id,
            SyncMessage::Content(m) => &m.id,
            SyncMessage::Done(m) => &m.id,
        }
    }

    /// Outgoing lane: non-content messages always go first.
    pub fn priority(&self) -> Priority {
        match self {
            SyncMessage::Content(piece) => piece.priority,
            _ => Priority::High,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known(_) => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done(_) => "done",
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        let sessions = match self {
            SyncMessage::Load(m) => m.sessions.len(),
            SyncMessage::Known(m) => m.sessions.len(),
            SyncMessage::Content(piece) => piece
                .new
                .len()
                .max(piece.expect_content_until.as_ref().map_or(0, |u| u.len())),
            SyncMessage::Done(_) => 0,
        };
        if sessions > limits::MAX_SESSIONS_PER_MESSAGE {
            return Err("too many sessions");
        }
        Ok(())
    }
}
