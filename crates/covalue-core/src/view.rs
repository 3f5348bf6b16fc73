//! Read-side materialization of valid transactions.
//!
//! Change formats:
//! - map: `{"op": "set", "key": k, "value": v}` and `{"op": "del", "key": k}`
//! - list: `{"op": "append", "value": v}`
//! - stream: any value, appended to the author's session entries

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

use crate::header::CoValueType;
use crate::ids::{SessionId, TransactionId};
use crate::pipeline::VerifiedTransaction;

/// Latest value of one map key.
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    pub value: Value,
    pub made_at: i64,
    pub by: TransactionId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapView {
    entries: BTreeMap<String, MapEntry>,
}

impl MapView {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply(&mut self, change: &Value, tx: &VerifiedTransaction) -> bool {
        let Some(key) = change.get("key").and_then(Value::as_str) else {
            return false;
        };
        match change.get("op").and_then(Value::as_str) {
            Some("set") => {
                let value = change.get("value").cloned().unwrap_or(Value::Null);
                self.entries.insert(
                    key.to_owned(),
                    MapEntry {
                        value,
                        made_at: tx.logical_made_at,
                        by: tx.logical_id,
                    },
                );
                true
            }
            Some("del") => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListView {
    items: Vec<Value>,
}

impl ListView {
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    fn apply(&mut self, change: &Value) -> bool {
        if change.get("op").and_then(Value::as_str) != Some("append") {
            return false;
        }
        self.items
            .push(change.get("value").cloned().unwrap_or(Value::Null));
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamView {
    sessions: BTreeMap<SessionId, Vec<Value>>,
}

impl StreamView {
    pub fn session(&self, session: &SessionId) -> &[Value] {
        self.sessions.get(session).map_or(&[], Vec::as_slice)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &[Value])> {
        self.sessions.iter().map(|(s, v)| (s, v.as_slice()))
    }

    fn apply(&mut self, change: &Value, tx: &VerifiedTransaction) {
        self.sessions
            .entry(tx.logical_id.session)
            .or_default()
            .push(change.clone());
    }
}

/// Content shape, selected once from the header type.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentView {
    Map(MapView),
    List(ListView),
    Stream(StreamView),
}

impl ContentView {
    /// Groups and accounts are maps.
    pub fn for_type(type_tag: CoValueType) -> Self {
        match type_tag {
            CoValueType::Map | CoValueType::Group | CoValueType::Account => {
                ContentView::Map(MapView::default())
            }
            CoValueType::List => ContentView::List(ListView::default()),
            CoValueType::Stream => ContentView::Stream(StreamView::default()),
        }
    }

    /// Apply every change of one transaction. Unknown changes are skipped.
    pub fn apply(&mut self, tx: &VerifiedTransaction) {
        let Some(changes) = &tx.changes else {
            return;
        };
        for change in changes {
            let applied = match self {
                ContentView::Map(map) => map.apply(change, tx),
                ContentView::List(list) => list.apply(change),
                ContentView::Stream(stream) => {
                    stream.apply(change, tx);
                    true
                }
            };
            if !applied {
                trace!(tx = ?tx.id, "skipping unrecognized change");
            }
        }
    }

    pub fn as_map(&self) -> Option<&MapView> {
        match self {
            ContentView::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListView> {
        match self {
            ContentView::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamView> {
        match self {
            ContentView::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

/// Map change setting `key`.
pub fn map_set(key: &str, value: Value) -> Value {
    serde_json::json!({ "op": "set", "key": key, "value": value })
}

/// Map change deleting `key`.
pub fn map_del(key: &str) -> Value {
    serde_json::json!({ "op": "del", "key": key })
}

/// List change appending `value`.
pub fn list_append(value: Value) -> Value {
    serde_json::json!({ "op": "append", "value": value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Author, CoValueId};
    use crate::pipeline::Validity;
    use crate::transaction::Transaction;
    use serde_json::json;

    fn record(index: u32, made_at: i64, changes: Vec<Value>) -> VerifiedTransaction {
        let session = SessionId::new(Author::Account(CoValueId::from_bytes([1; 32])), [0; 8]);
        let id = TransactionId::new(session, index);
        VerifiedTransaction {
            id,
            tx: Transaction::trusting(&changes, None, made_at).unwrap(),
            validity: Validity::Valid,
            changes: Some(changes),
            meta: None,
            logical_id: id,
            logical_made_at: made_at,
            record: None,
        }
    }

    #[test]
    fn test_map_set_and_delete() {
        let mut view = ContentView::for_type(CoValueType::Map);
        view.apply(&record(0, 1, vec![map_set("a", json!(1)), map_set("b", json!(2))]));
        view.apply(&record(1, 2, vec![map_del("a"), map_set("b", json!(3))]));

        let map = view.as_map().unwrap();
        assert_eq!(map.get("a"), None);
        assert_eq!(map.get("b"), Some(&json!(3)));
        assert_eq!(map.entry("b").unwrap().made_at, 2);
    }

    #[test]
    fn test_group_uses_map_shape() {
        assert!(ContentView::for_type(CoValueType::Group).as_map().is_some());
        assert!(ContentView::for_type(CoValueType::Account).as_map().is_some());
    }

    #[test]
    fn test_list_append_skips_unknown_ops() {
        let mut view = ContentView::for_type(CoValueType::List);
        view.apply(&record(0, 1, vec![list_append(json!("x")), json!({"op": "insert"})]));
        view.apply(&record(1, 2, vec![list_append(json!("y"))]));
        assert_eq!(view.as_list().unwrap().items(), &[json!("x"), json!("y")]);
    }

    #[test]
    fn test_stream_groups_by_session() {
        let mut view = ContentView::for_type(CoValueType::Stream);
        let tx = record(0, 1, vec![json!({"hello": "world"})]);
        view.apply(&tx);
        let stream = view.as_stream().unwrap();
        assert_eq!(stream.session(&tx.id.session), &[json!({"hello": "world"})]);
    }
}
