//! CoValue headers: the immutable, content-addressed part of a CoValue.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{Author, CoValueId};

/// Declared shape of a CoValue. Selects the content view at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    Map,
    List,
    Stream,
    Group,
    Account,
}

impl CoValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            CoValueType::Map => "map",
            CoValueType::List => "list",
            CoValueType::Stream => "stream",
            CoValueType::Group => "group",
            CoValueType::Account => "account",
        }
    }
}

/// Which permission rules apply to a CoValue's transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ruleset {
    /// Every correctly signed transaction is valid.
    UnsafeAllowAll,
    /// The CoValue is itself a group, founded by `initial_admin`.
    Group { initial_admin: Author },
    /// Writes are authorized by membership in another group.
    OwnedByGroup { group: CoValueId },
}

/// Sync priority, used to order outgoing lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// The immutable header of a CoValue. Its canonical hash is the CoValue id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub type_tag: CoValueType,
    pub ruleset: Ruleset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniqueness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl CoValueHeader {
    /// Meta key naming the source of a branch.
    pub const BRANCH_OF: &'static str = "branch_of";

    /// A header with a random uniqueness seed.
    pub fn new(type_tag: CoValueType, ruleset: Ruleset) -> Self {
        let mut seed = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            type_tag,
            ruleset,
            meta: None,
            uniqueness: Some(hex::encode(seed)),
            created_at: None,
        }
    }

    /// Replace the uniqueness seed, making the id reproducible.
    pub fn with_uniqueness(mut self, uniqueness: impl Into<String>) -> Self {
        self.uniqueness = Some(uniqueness.into());
        self
    }

    pub fn with_meta(mut self, meta: Map<String, Value>) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Mark this header as a branch of `source`.
    pub fn with_branch_of(mut self, source: CoValueId, name: &str) -> Self {
        let meta = self.meta.get_or_insert_with(Map::new);
        meta.insert(Self::BRANCH_OF.into(), Value::String(source.to_string()));
        meta.insert("branch_name".into(), Value::String(name.to_owned()));
        self
    }

    /// The source this CoValue was branched from, if any.
    pub fn branch_source(&self) -> Option<CoValueId> {
        self.meta
            .as_ref()?
            .get(Self::BRANCH_OF)?
            .as_str()
            .and_then(|s| CoValueId::parse(s).ok())
    }

    /// CoValues that must be available before this one can be validated.
    pub fn dependencies(&self) -> Vec<CoValueId> {
        let mut deps = Vec::new();
        if let Ruleset::OwnedByGroup { group } = &self.ruleset {
            deps.push(*group);
        }
        if let Some(source) = self.branch_source() {
            if !deps.contains(&source) {
                deps.push(source);
            }
        }
        deps
    }

    pub fn priority(&self) -> Priority {
        match self.type_tag {
            CoValueType::Group | CoValueType::Account => Priority::High,
            CoValueType::Stream => Priority::Low,
            CoValueType::Map | CoValueType::List => Priority::Medium,
        }
    }
}
