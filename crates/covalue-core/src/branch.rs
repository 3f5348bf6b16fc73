//! Branch and merge bookkeeping derived from transaction metadata.
//!
//! Nothing here is stored separately: every record is recovered by scanning
//! the metadata of valid transactions, so a permission reset simply rebuilds
//! it.

use serde_json::{json, Value};

use crate::ids::{CoValueId, SessionId, TransactionId};
use crate::known_state::SessionCounts;

/// Origin of a transaction copied from a branch into its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedOrigin {
    pub tx: TransactionId,
    pub made_at: i64,
}

/// A classified metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaRecord {
    /// First transaction of a branch: the source state it was cut from.
    BranchStart(SessionCounts),
    /// Written to a source when a branch is created.
    BranchPointer { branch: CoValueId, name: String },
    /// Written to a source when a branch is merged back.
    MergeCommit {
        branch: CoValueId,
        sessions: SessionCounts,
    },
    /// A transaction carried over from a branch.
    Merged(MergedOrigin),
}

impl MetaRecord {
    /// Classify a metadata object. Unknown shapes are not branch records.
    pub fn classify(meta: &Value) -> Option<Self> {
        let obj = meta.as_object()?;

        if let Some(start) = obj.get("branch_start") {
            return serde_json::from_value(start.clone())
                .ok()
                .map(MetaRecord::BranchStart);
        }
        if let Some(branch) = obj.get("branch").and_then(Value::as_str) {
            let branch = CoValueId::parse(branch).ok()?;
            let name = obj
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            return Some(MetaRecord::BranchPointer { branch, name });
        }
        if let Some(branch) = obj.get("merge").and_then(Value::as_str) {
            let branch = CoValueId::parse(branch).ok()?;
            let sessions = obj
                .get("sessions")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
                .unwrap_or_default();
            return Some(MetaRecord::MergeCommit { branch, sessions });
        }
        if let Some(merged) = obj.get("merged").and_then(Value::as_object) {
            let session = SessionId::parse(merged.get("session")?.as_str()?).ok()?;
            let index = u32::try_from(merged.get("index")?.as_u64()?).ok()?;
            let made_at = merged.get("made_at")?.as_i64()?;
            return Some(MetaRecord::Merged(MergedOrigin {
                tx: TransactionId::new(session, index),
                made_at,
            }));
        }
        None
    }

    /// Metadata encoding of this record.
    pub fn to_meta(&self) -> Value {
        match self {
            MetaRecord::BranchStart(sessions) => json!({ "branch_start": sessions }),
            MetaRecord::BranchPointer { branch, name } => {
                json!({ "branch": branch.to_string(), "name": name })
            }
            MetaRecord::MergeCommit { branch, sessions } => {
                json!({ "merge": branch.to_string(), "sessions": sessions })
            }
            MetaRecord::Merged(origin) => json!({
                "merged": {
                    "session": origin.tx.session.to_string(),
                    "index": origin.tx.index,
                    "made_at": origin.made_at,
                }
            }),
        }
    }
}

/// Branch pointer recorded on a source CoValue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPointer {
    pub branch: CoValueId,
    pub name: String,
    pub created_by: TransactionId,
}

/// Merge commit recorded on a source CoValue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCommit {
    pub branch: CoValueId,
    pub sessions: SessionCounts,
    pub committed_by: TransactionId,
}

/// Everything derived from branch metadata so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchState {
    pub branch_start: Option<SessionCounts>,
    pub pointers: Vec<BranchPointer>,
    pub merge_commits: Vec<MergeCommit>,
}

impl BranchState {
    /// Pointer for a branch, if this CoValue has one.
    pub fn pointer(&self, branch: &CoValueId) -> Option<&BranchPointer> {
        self.pointers.iter().find(|p| &p.branch == branch)
    }

    /// True once a merge commit for `branch` has been seen.
    pub fn is_merged(&self, branch: &CoValueId) -> bool {
        self.merge_commits.iter().any(|m| &m.branch == branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Author;

    fn session() -> SessionId {
        SessionId::new(Author::Account(CoValueId::from_bytes([7; 32])), [1; 8])
    }

    #[test]
    fn test_classify_records_roundtrip() {
        let mut sessions = SessionCounts::new();
        sessions.insert(session(), 4);
        let records = [
            MetaRecord::BranchStart(sessions.clone()),
            MetaRecord::BranchPointer {
                branch: CoValueId::from_bytes([1; 32]),
                name: "draft".into(),
            },
            MetaRecord::MergeCommit {
                branch: CoValueId::from_bytes([1; 32]),
                sessions,
            },
            MetaRecord::Merged(MergedOrigin {
                tx: TransactionId::new(session(), 2),
                made_at: 99,
            }),
        ];
        for record in records {
            assert_eq!(MetaRecord::classify(&record.to_meta()), Some(record));
        }
    }

    #[test]
    fn test_classify_ignores_other_meta() {
        assert_eq!(MetaRecord::classify(&json!({"note": "hi"})), None);
        assert_eq!(MetaRecord::classify(&json!("text")), None);
        assert_eq!(MetaRecord::classify(&json!({"branch": "not-an-id"})), None);
    }
}
