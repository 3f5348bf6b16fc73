//! Log transactions.
//!
//! A transaction is immutable once appended. Trusting transactions carry
//! their change list as plaintext JSON; private ones carry it sealed under a
//! read key.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonical_transaction_bytes;
use crate::crypto::{CryptoProvider, KeyId, KeySecret, NonceMaterial};
use crate::error::{CoreError, Result};

/// One entry in a session log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "lowercase")]
pub enum Transaction {
    #[serde(rename_all = "camelCase")]
    Trusting {
        made_at: i64,
        /// Serialized JSON array of changes.
        changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: i64,
        key_used: KeyId,
        encrypted_changes: Bytes,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_meta: Option<Bytes>,
    },
}

impl Transaction {
    /// Build a trusting transaction from JSON changes and optional metadata.
    pub fn trusting(changes: &[Value], meta: Option<&Value>, made_at: i64) -> Result<Self> {
        let changes =
            serde_json::to_string(changes).map_err(|e| CoreError::EncodingError(e.to_string()))?;
        let meta = meta
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(Transaction::Trusting {
            made_at,
            changes,
            meta,
        })
    }

    /// Build a private transaction sealed under `key`.
    ///
    /// The nonce binds the ciphertext to the slot the transaction will occupy.
    pub fn private(
        crypto: &dyn CryptoProvider,
        key: &KeySecret,
        nonce: &NonceMaterial,
        changes: &[Value],
        meta: Option<&Value>,
        made_at: i64,
    ) -> Result<Self> {
        let plain =
            serde_json::to_vec(changes).map_err(|e| CoreError::EncodingError(e.to_string()))?;
        let encrypted_changes = crypto.encrypt(key, &plain, nonce)?;
        let encrypted_meta = match meta {
            Some(meta) => {
                let plain =
                    serde_json::to_vec(meta).map_err(|e| CoreError::EncodingError(e.to_string()))?;
                let mut meta_nonce = *nonce;
                // Meta uses the sibling slot so it never shares a nonce with the changes.
                meta_nonce.tx.index = meta_nonce.tx.index.wrapping_add(1 << 31);
                Some(crypto.encrypt(key, &plain, &meta_nonce)?)
            }
            None => None,
        };
        Ok(Transaction::Private {
            made_at,
            key_used: key.key_id(),
            encrypted_changes,
            encrypted_meta,
        })
    }

    pub fn made_at(&self) -> i64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }

    /// Bytes of payload carried, used for checkpointing and chunking.
    pub fn payload_size(&self) -> usize {
        match self {
            Transaction::Trusting { changes, meta, .. } => {
                changes.len() + meta.as_ref().map_or(0, String::len)
            }
            Transaction::Private {
                encrypted_changes,
                encrypted_meta,
                ..
            } => encrypted_changes.len() + encrypted_meta.as_ref().map_or(0, Bytes::len),
        }
    }

    /// Canonical bytes fed to the session's rolling hash.
    pub fn encoded(&self) -> Vec<u8> {
        canonical_transaction_bytes(self)
    }
}

/// Decrypt a private transaction's changes and metadata.
pub fn decrypt_private(
    crypto: &dyn CryptoProvider,
    key: &KeySecret,
    nonce: &NonceMaterial,
    encrypted_changes: &[u8],
    encrypted_meta: Option<&[u8]>,
) -> Result<(Vec<Value>, Option<Value>)> {
    let plain = crypto.decrypt(key, encrypted_changes, nonce)?;
    let changes =
        serde_json::from_slice(&plain).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    let meta = match encrypted_meta {
        Some(sealed) => {
            let mut meta_nonce = *nonce;
            meta_nonce.tx.index = meta_nonce.tx.index.wrapping_add(1 << 31);
            let plain = crypto.decrypt(key, sealed, &meta_nonce)?;
            Some(serde_json::from_slice(&plain).map_err(|e| CoreError::DecodingError(e.to_string()))?)
        }
        None => None,
    };
    Ok((changes, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SignerSecret, StandardCrypto};
    use crate::ids::{Author, CoValueId, SessionId, TransactionId};
    use serde_json::json;

    fn nonce() -> NonceMaterial {
        let signer = SignerSecret::from_seed(&[1; 32]).signer_id();
        NonceMaterial {
            covalue: CoValueId::from_bytes([4; 32]),
            tx: TransactionId::new(SessionId::new(Author::Agent(signer), [0; 8]), 3),
        }
    }

    #[test]
    fn test_trusting_payload_size() {
        let tx = Transaction::trusting(&[json!({"hello": "world"})], None, 1).unwrap();
        assert_eq!(tx.payload_size(), r#"[{"hello":"world"}]"#.len());
        assert_eq!(tx.made_at(), 1);
        assert!(!tx.is_private());
    }

    #[test]
    fn test_private_roundtrip() {
        let key = KeySecret::generate();
        let tx = Transaction::private(
            &StandardCrypto,
            &key,
            &nonce(),
            &[json!({"op": "set", "key": "a", "value": 1})],
            Some(&json!({"note": "x"})),
            10,
        )
        .unwrap();

        let Transaction::Private {
            key_used,
            encrypted_changes,
            encrypted_meta,
            ..
        } = &tx
        else {
            panic!("expected private transaction");
        };
        assert_eq!(*key_used, key.key_id());

        let (changes, meta) = decrypt_private(
            &StandardCrypto,
            &key,
            &nonce(),
            encrypted_changes,
            encrypted_meta.as_deref(),
        )
        .unwrap();
        assert_eq!(changes, vec![json!({"op": "set", "key": "a", "value": 1})]);
        assert_eq!(meta, Some(json!({"note": "x"})));
    }

    #[test]
    fn test_encoding_distinguishes_transactions() {
        let a = Transaction::trusting(&[json!(1)], None, 1).unwrap();
        let b = Transaction::trusting(&[json!(1)], None, 2).unwrap();
        assert_eq!(a.encoded(), a.clone().encoded());
        assert_ne!(a.encoded(), b.encoded());
    }

    #[test]
    fn test_wire_shape() {
        let tx = Transaction::trusting(&[json!(1)], Some(&json!({"k": 1})), 5).unwrap();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["privacy"], "trusting");
        assert_eq!(json["madeAt"], 5);
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
