//! The stored form of one CoValue, shared by both backends.
//!
//! A stored session keeps its transactions and the signature recorded at the
//! end of every piece it was written with. Those signature positions are the
//! checkpoint boundaries pieces are split at when the CoValue is loaded.

use std::collections::BTreeMap;

use covalue_core::{
    CoValueHeader, CoValueId, ContentPiece, KnownState, SessionId, SessionNewContent, Signature,
    Transaction,
};

/// Transactions of one session plus checkpoint signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredSession {
    pub transactions: Vec<Transaction>,
    /// Index of the last transaction covered → signature over the hash there.
    pub signatures: BTreeMap<u32, Signature>,
}

impl StoredSession {
    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Slices `(after, end, signature)` between consecutive checkpoints.
    fn segments(&self) -> Vec<(u32, u32, Signature)> {
        let mut segments = Vec::with_capacity(self.signatures.len());
        let mut after = 0;
        for (&idx, signature) in self.signatures.range(..self.len()) {
            segments.push((after, idx + 1, *signature));
            after = idx + 1;
        }
        segments
    }
}

/// Where an incoming piece lands relative to what is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fit {
    /// Every session continues at or before its stored count.
    Continues,
    /// No header stored and none in the piece.
    MissingHeader,
    /// Some session starts beyond its stored count.
    Gap,
}

/// Header and sessions of one stored CoValue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCoValue {
    pub id: CoValueId,
    pub header: CoValueHeader,
    pub sessions: BTreeMap<SessionId, StoredSession>,
}

impl StoredCoValue {
    pub fn new(id: CoValueId, header: CoValueHeader) -> Self {
        Self {
            id,
            header,
            sessions: BTreeMap::new(),
        }
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .filter(|(_, s)| !s.is_empty())
                .map(|(id, s)| (*id, s.len()))
                .collect(),
        }
    }

    pub fn count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).map_or(0, StoredSession::len)
    }

    /// Append the part of `content` not stored yet. The caller checked
    /// that `content.after` does not leave a gap.
    pub fn append(&mut self, session: SessionId, content: &SessionNewContent) {
        let stored = self.sessions.entry(session).or_default();
        let skip = (stored.len() - content.after) as usize;
        if skip >= content.new_transactions.len() {
            return;
        }
        stored
            .transactions
            .extend_from_slice(&content.new_transactions[skip..]);
        stored.signatures.insert(stored.len() - 1, content.last_signature);
    }

    /// Pieces in load order: the first carries the header and every piece
    /// takes the next checkpoint segment of each session.
    pub fn pieces(&self) -> Vec<ContentPiece> {
        let priority = self.header.priority();
        let segmented: Vec<(SessionId, &StoredSession, Vec<(u32, u32, Signature)>)> = self
            .sessions
            .iter()
            .map(|(id, s)| (*id, s, s.segments()))
            .collect();
        let rounds = segmented.iter().map(|(_, _, s)| s.len()).max().unwrap_or(0);

        let mut pieces = Vec::with_capacity(rounds.max(1));
        pieces.push(ContentPiece::new(self.id, Some(self.header.clone()), priority));
        for round in 0..rounds {
            if round > 0 {
                pieces.push(ContentPiece::new(self.id, None, priority));
            }
            let Some(piece) = pieces.last_mut() else {
                break;
            };
            for (session, stored, segments) in &segmented {
                let Some(&(after, end, last_signature)) = segments.get(round) else {
                    continue;
                };
                piece.new.insert(
                    *session,
                    SessionNewContent {
                        after,
                        new_transactions: stored.transactions[after as usize..end as usize]
                            .to_vec(),
                        last_signature,
                    },
                );
            }
        }
        pieces
    }
}

/// How a piece fits onto the stored counts returned by `count`.
pub(crate) fn fit(
    piece: &ContentPiece,
    has_header: bool,
    count: impl Fn(&SessionId) -> u32,
) -> Fit {
    if !has_header && piece.header.is_none() {
        return Fit::MissingHeader;
    }
    if piece.new.iter().any(|(session, c)| c.after > count(session)) {
        return Fit::Gap;
    }
    Fit::Continues
}
