//! Read keys and their distribution.
//!
//! A [`KeyRing`] holds the symmetric read keys this node can use. Keys reach
//! other members as [`SealedKey`]s: the read key encrypted for one X25519
//! recipient, written into the group's map under
//! [`SealedKey::entry_name`] by an admin.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use covalue_core::{CoValueId, KeyId, KeySecret};

use crate::crypto::{EphemeralKeyPair, SealNonce, X25519PublicKey, X25519StaticSecret};
use crate::error::{PermsError, Result};

/// Symmetric read keys known to this node.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: HashMap<KeyId, KeySecret>,
    current: HashMap<CoValueId, KeyId>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: KeySecret) -> KeyId {
        let id = key.key_id();
        self.keys.insert(id, key);
        id
    }

    pub fn get(&self, id: &KeyId) -> Option<&KeySecret> {
        self.keys.get(id)
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        self.keys.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key used for new private writes under `group`.
    pub fn current_for(&self, group: &CoValueId) -> Option<&KeySecret> {
        self.current.get(group).and_then(|id| self.keys.get(id))
    }

    /// Generate a fresh key and make it current for `group`.
    pub fn rotate(&mut self, group: CoValueId) -> KeyId {
        let id = self.insert(KeySecret::generate());
        self.current.insert(group, id);
        id
    }

    /// Make a known key current for `group`.
    pub fn set_current(&mut self, group: CoValueId, id: KeyId) -> Result<()> {
        if !self.keys.contains_key(&id) {
            return Err(PermsError::KeyNotFound(id));
        }
        self.current.insert(group, id);
        Ok(())
    }
}

/// A read key encrypted for one recipient.
///
/// The wrapping key comes from an ephemeral X25519 agreement bound to the
/// group id, so a sealed key cannot be replayed into another group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub key_id: KeyId,
    pub group: CoValueId,
    pub ephemeral_public: X25519PublicKey,
    pub encrypted_key: Vec<u8>,
    pub nonce: SealNonce,
}

impl SealedKey {
    /// Seal `key` for `recipient`.
    pub fn seal(group: CoValueId, key: &KeySecret, recipient: &X25519PublicKey) -> Result<Self> {
        let ephemeral = EphemeralKeyPair::generate();
        let ephemeral_public = ephemeral.public_key();
        let wrap_key = ephemeral
            .diffie_hellman(recipient)
            .derive_wrap_key(group.as_bytes());

        let nonce = SealNonce::generate();
        let encrypted_key = wrap_key.encrypt(key.as_bytes(), &nonce)?;
        Ok(Self {
            key_id: key.key_id(),
            group,
            ephemeral_public,
            encrypted_key,
            nonce,
        })
    }

    /// Recover the read key with the recipient's secret.
    pub fn open(&self, recipient: &X25519StaticSecret) -> Result<KeySecret> {
        let wrap_key = recipient
            .diffie_hellman(&self.ephemeral_public)
            .derive_wrap_key(self.group.as_bytes());
        let bytes = wrap_key.decrypt(&self.encrypted_key, &self.nonce)?;
        let bytes = <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
            PermsError::Decryption(format!("invalid key length: expected 32, got {}", bytes.len()))
        })?;

        let key = KeySecret(bytes);
        if key.key_id() != self.key_id {
            return Err(PermsError::Decryption(format!(
                "sealed key does not match {}",
                self.key_id
            )));
        }
        Ok(key)
    }

    /// Group map key under which a sealed key for `recipient` is stored.
    pub fn entry_name(key_id: &KeyId, recipient: &X25519PublicKey) -> String {
        format!("{key_id}_for_{recipient}")
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| PermsError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| PermsError::Serialization(e.to_string()))
    }

    /// Map value form: hex of the CBOR encoding.
    pub fn to_value(&self) -> Result<Value> {
        Ok(Value::String(hex::encode(self.to_bytes()?)))
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let text = value
            .as_str()
            .ok_or_else(|| PermsError::Serialization("sealed key is not a string".into()))?;
        let bytes = hex::decode(text).map_err(|e| PermsError::Serialization(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> CoValueId {
        CoValueId::from_bytes([0x42; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let recipient = X25519StaticSecret::generate();
        let key = KeySecret::generate();

        let sealed = SealedKey::seal(group(), &key, &recipient.public_key()).unwrap();
        assert_eq!(sealed.key_id, key.key_id());
        assert_eq!(sealed.open(&recipient).unwrap(), key);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let recipient = X25519StaticSecret::generate();
        let other = X25519StaticSecret::generate();
        let sealed =
            SealedKey::seal(group(), &KeySecret::generate(), &recipient.public_key()).unwrap();
        assert!(sealed.open(&other).is_err());
    }

    #[test]
    fn test_replay_into_other_group_fails() {
        let recipient = X25519StaticSecret::generate();
        let mut sealed =
            SealedKey::seal(group(), &KeySecret::generate(), &recipient.public_key()).unwrap();
        sealed.group = CoValueId::from_bytes([1; 32]);
        assert!(sealed.open(&recipient).is_err());
    }

    #[test]
    fn test_value_form_roundtrip() {
        let recipient = X25519StaticSecret::generate();
        let sealed =
            SealedKey::seal(group(), &KeySecret::generate(), &recipient.public_key()).unwrap();
        let value = sealed.to_value().unwrap();
        assert_eq!(SealedKey::from_value(&value).unwrap(), sealed);
        assert!(SealedKey::from_value(&Value::Bool(true)).is_err());
    }

    #[test]
    fn test_keyring_rotation() {
        let mut ring = KeyRing::new();
        assert!(ring.current_for(&group()).is_none());

        let first = ring.rotate(group());
        let second = ring.rotate(group());
        assert_ne!(first, second);
        assert_eq!(ring.current_for(&group()).unwrap().key_id(), second);
        assert!(ring.contains(&first));

        ring.set_current(group(), first).unwrap();
        assert_eq!(ring.current_for(&group()).unwrap().key_id(), first);
        assert!(ring.set_current(group(), KeySecret::generate().key_id()).is_err());
    }
}
