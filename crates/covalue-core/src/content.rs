//! Content pieces: the unit a Log Store produces for a peer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Signature;
use crate::header::{CoValueHeader, Priority};
use crate::ids::{CoValueId, SessionId};
use crate::known_state::SessionCounts;
use crate::transaction::Transaction;

/// New transactions for one session, continuing from `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewContent {
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the session hash after the last transaction in this slice.
    pub last_signature: Signature,
}

impl SessionNewContent {
    /// Count the session reaches once this slice is applied.
    pub fn end(&self) -> u32 {
        self.after + self.new_transactions.len() as u32
    }
}

/// One chunk of a CoValue's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPiece {
    pub id: CoValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: Priority,
    pub new: BTreeMap<SessionId, SessionNewContent>,
    /// Full extent of an in-flight stream, set on the first of several pieces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_content_until: Option<SessionCounts>,
}

impl ContentPiece {
    pub fn new(id: CoValueId, header: Option<CoValueHeader>, priority: Priority) -> Self {
        Self {
            id,
            header,
            priority,
            new: BTreeMap::new(),
            expect_content_until: None,
        }
    }

    /// Neither a header nor any transactions.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|s| s.new_transactions.len()).sum()
    }

    pub fn payload_size(&self) -> usize {
        self.new
            .values()
            .flat_map(|s| s.new_transactions.iter())
            .map(Transaction::payload_size)
            .sum()
    }
}
