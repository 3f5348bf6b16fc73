//! Canonical CBOR encoding for deterministic hashing.
//!
//! Headers and transactions are hashed, so their bytes must be identical on
//! every platform. This module implements RFC 8949 Core Deterministic Encoding
//! for the small set of values we build ourselves:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats (opaque JSON is embedded as its serialized bytes)

use ciborium::value::Value;

use crate::header::{CoValueHeader, Ruleset};
use crate::transaction::Transaction;

/// Field keys (integer keys for compact encoding).
mod keys {
    pub const TYPE: u64 = 0;
    pub const RULESET: u64 = 1;
    pub const META: u64 = 2;
    pub const UNIQUENESS: u64 = 3;
    pub const CREATED_AT: u64 = 4;

    pub const RULESET_KIND: u64 = 0;
    pub const RULESET_SUBJECT: u64 = 1;

    pub const TX_PRIVACY: u64 = 0;
    pub const TX_MADE_AT: u64 = 1;
    pub const TX_CHANGES: u64 = 2;
    pub const TX_META: u64 = 3;
    pub const TX_KEY: u64 = 4;
}

fn key(k: u64) -> Value {
    Value::Integer(k.into())
}

fn opt_text(s: Option<&str>) -> Value {
    s.map_or(Value::Null, |s| Value::Text(s.to_owned()))
}

/// Encode a header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &CoValueHeader) -> Vec<u8> {
    let (kind, subject) = match &header.ruleset {
        Ruleset::UnsafeAllowAll => ("unsafe_allow_all", Value::Null),
        Ruleset::Group { initial_admin } => ("group", Value::Text(initial_admin.to_string())),
        Ruleset::OwnedByGroup { group } => ("owned_by_group", Value::Text(group.to_string())),
    };
    let ruleset = Value::Map(vec![
        (key(keys::RULESET_KIND), Value::Text(kind.into())),
        (key(keys::RULESET_SUBJECT), subject),
    ]);

    // serde_json maps are ordered by key, so this is deterministic.
    let meta = header
        .meta
        .as_ref()
        .and_then(|m| serde_json::to_vec(m).ok())
        .map_or(Value::Null, Value::Bytes);

    let created_at = header
        .created_at
        .map_or(Value::Null, |t| Value::Integer(t.into()));

    let value = Value::Map(vec![
        (key(keys::TYPE), Value::Text(header.type_tag.as_str().into())),
        (key(keys::RULESET), ruleset),
        (key(keys::META), meta),
        (key(keys::UNIQUENESS), opt_text(header.uniqueness.as_deref())),
        (key(keys::CREATED_AT), created_at),
    ]);
    encode_cbor_value_canonical(&value)
}

/// Encode a transaction to canonical CBOR bytes.
pub fn canonical_transaction_bytes(tx: &Transaction) -> Vec<u8> {
    let value = match tx {
        Transaction::Trusting {
            made_at,
            changes,
            meta,
        } => Value::Map(vec![
            (key(keys::TX_PRIVACY), Value::Text("trusting".into())),
            (key(keys::TX_MADE_AT), Value::Integer((*made_at).into())),
            (key(keys::TX_CHANGES), Value::Text(changes.clone())),
            (key(keys::TX_META), opt_text(meta.as_deref())),
        ]),
        Transaction::Private {
            made_at,
            key_used,
            encrypted_changes,
            encrypted_meta,
        } => Value::Map(vec![
            (key(keys::TX_PRIVACY), Value::Text("private".into())),
            (key(keys::TX_MADE_AT), Value::Integer((*made_at).into())),
            (key(keys::TX_CHANGES), Value::Bytes(encrypted_changes.to_vec())),
            (
                key(keys::TX_META),
                encrypted_meta
                    .as_ref()
                    .map_or(Value::Null, |m| Value::Bytes(m.to_vec())),
            ),
            (key(keys::TX_KEY), Value::Text(key_used.to_string())),
        ]),
    };
    encode_cbor_value_canonical(&value)
}

fn encode_cbor_value_canonical(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value);
    buf
}

/// Recursively encode a CBOR value.
///
/// Only the variants produced by this module are reachable.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::Text(s) => {
            encode_uint(buf, 3, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item);
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries),
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        _ => unreachable!("canonical encoder only receives values built in this module"),
    }
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: ciborium::value::Integer) {
    let n: i128 = i.into();
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a map with keys sorted by their encoded bytes.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) {
    let mut pairs: Vec<(Vec<u8>, &Value)> = entries
        .iter()
        .map(|(k, v)| {
            let mut key_buf = Vec::new();
            encode_value_to(&mut key_buf, k);
            (key_buf, v)
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CoValueType;
    use crate::ids::CoValueId;
    use serde_json::json;

    #[test]
    fn test_header_encoding_deterministic() {
        let header = CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll)
            .with_uniqueness("u")
            .with_created_at(1736870400000);
        assert_eq!(canonical_header_bytes(&header), canonical_header_bytes(&header.clone()));
    }

    #[test]
    fn test_header_meta_order_independent() {
        let mut a = serde_json::Map::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = serde_json::Map::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));

        let base = CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll).with_uniqueness("u");
        assert_eq!(
            canonical_header_bytes(&base.clone().with_meta(a)),
            canonical_header_bytes(&base.with_meta(b))
        );
    }

    #[test]
    fn test_ruleset_changes_encoding() {
        let a = CoValueHeader::new(CoValueType::Map, Ruleset::UnsafeAllowAll).with_uniqueness("u");
        let mut b = a.clone();
        b.ruleset = Ruleset::OwnedByGroup {
            group: CoValueId::from_bytes([1; 32]),
        };
        assert_ne!(canonical_header_bytes(&a), canonical_header_bytes(&b));
    }

    #[test]
    fn test_negative_timestamp_encoding() {
        let tx = Transaction::trusting(&[json!(1)], None, -1).unwrap();
        let bytes = canonical_transaction_bytes(&tx);
        // map(4), key 0 "trusting" ... key 1 then -1 encoded as 0x20
        let pos = bytes.iter().position(|b| *b == 0x01).unwrap();
        assert_eq!(bytes[pos + 1], 0x20);
    }

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);

        buf.clear();
        encode_uint(&mut buf, 0, 0x1_0000_0000);
        assert_eq!(buf[0], 0x1b);
    }

    #[test]
    fn test_map_key_ordering() {
        let mut buf = Vec::new();
        let entries = vec![
            (key(8), Value::Integer(80.into())),
            (key(0), Value::Integer(0.into())),
            (key(5), Value::Integer(50.into())),
        ];
        encode_map_canonical(&mut buf, &entries);

        assert_eq!(buf[0], 0xa3);
        assert_eq!(buf[1], 0x00);
        assert_eq!(buf[3], 0x05);
        assert_eq!(buf[6], 0x08);
    }
}
