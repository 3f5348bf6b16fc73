//! Group role state.
//!
//! Roles are never stored as flags. They are recovered by replaying the
//! valid `set` operations of a group's map, where the key is a member's
//! author id and the value one of `admin`, `writer`, `reader`, `revoked`.
//! Every change is kept with its timestamp, so a role can be asked for at
//! any point in time.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use covalue_core::{map_set, Author, VerifiedTransaction};

use crate::error::PermsError;

/// A member's role in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Writer,
    Reader,
    Revoked,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Revoked => "revoked",
        }
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    /// Admins and writers may write to CoValues owned by the group.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin | Role::Writer)
    }

    pub fn can_read(self) -> bool {
        self != Role::Revoked
    }

    /// The group change assigning this role to `member`.
    pub fn change_for(self, member: &Author) -> Value {
        map_set(&member.to_string(), Value::String(self.as_str().into()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "revoked" => Ok(Role::Revoked),
            other => Err(PermsError::InvalidRoleChange(format!("unknown role: {other}"))),
        }
    }
}

/// Role assignments carried by one transaction. Other map entries are skipped.
pub fn role_changes(tx: &VerifiedTransaction) -> Vec<(String, Role)> {
    let Some(changes) = &tx.changes else {
        return Vec::new();
    };
    changes
        .iter()
        .filter(|c| c.get("op").and_then(Value::as_str) == Some("set"))
        .filter_map(|c| {
            let member = c.get("key")?.as_str()?;
            let role = c.get("value")?.as_str()?.parse().ok()?;
            Some((member.to_owned(), role))
        })
        .collect()
}

/// Role history of one group.
#[derive(Debug, Clone, Default)]
pub struct RoleTimeline {
    /// Member → changes ordered by time.
    changes: HashMap<String, Vec<(i64, Role)>>,
}

impl RoleTimeline {
    /// A group whose founder is admin from the start.
    pub fn new(initial_admin: &Author) -> Self {
        let mut timeline = Self::default();
        timeline.apply(&initial_admin.to_string(), Role::Admin, i64::MIN);
        timeline
    }

    /// Replay already-validated group transactions.
    pub fn from_valid<'a>(
        initial_admin: &Author,
        txs: impl IntoIterator<Item = &'a VerifiedTransaction>,
    ) -> Self {
        let mut timeline = Self::new(initial_admin);
        for tx in txs {
            timeline.apply_transaction(tx);
        }
        timeline
    }

    pub fn apply(&mut self, member: &str, role: Role, at: i64) {
        let history = self.changes.entry(member.to_owned()).or_default();
        let pos = history.partition_point(|(t, _)| *t <= at);
        history.insert(pos, (at, role));
    }

    pub fn apply_transaction(&mut self, tx: &VerifiedTransaction) {
        for (member, role) in role_changes(tx) {
            self.apply(&member, role, tx.logical_made_at);
        }
    }

    /// Role of `member` at time `at`, if any was ever assigned by then.
    pub fn role_at(&self, member: &Author, at: i64) -> Option<Role> {
        let history = self.changes.get(&member.to_string())?;
        let pos = history.partition_point(|(t, _)| *t <= at);
        pos.checked_sub(1).map(|i| history[i].1)
    }

    pub fn is_admin_at(&self, member: &Author, at: i64) -> bool {
        self.role_at(member, at).is_some_and(Role::is_admin)
    }

    pub fn can_write_at(&self, member: &Author, at: i64) -> bool {
        self.role_at(member, at).is_some_and(Role::can_write)
    }

    /// Current role of every member ever named.
    pub fn members(&self) -> Vec<(String, Role)> {
        let mut members: Vec<(String, Role)> = self
            .changes
            .iter()
            .filter_map(|(m, h)| h.last().map(|(_, r)| (m.clone(), *r)))
            .collect();
        members.sort();
        members
    }
}
