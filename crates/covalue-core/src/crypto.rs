//! Cryptographic primitives and the crypto provider seam.
//!
//! Ed25519 signs session hashes, BLAKE3 derives ids and rolling hashes, and
//! ChaCha20-Poly1305 seals private transaction payloads. The rest of the
//! crate only talks to these through [`CryptoProvider`].

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::canonical_header_bytes;
use crate::error::{CoreError, Result};
use crate::header::CoValueHeader;
use crate::ids::{decode_hex_array, CoValueId, TransactionId};

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero hash (sentinel value).
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Blake3Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental hash over a session's transactions.
///
/// Each transaction is fed in append order; [`RollingHash::digest`] can be
/// taken after any transaction without disturbing the running state.
#[derive(Clone)]
pub struct RollingHash {
    hasher: blake3::Hasher,
}

impl RollingHash {
    pub fn new() -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"covalue-session-v0:");
        Self { hasher }
    }

    /// Feed one encoded transaction.
    pub fn update(&mut self, encoded_tx: &[u8]) {
        self.hasher.update(&(encoded_tx.len() as u64).to_be_bytes());
        self.hasher.update(encoded_tx);
    }

    /// Hash of everything fed so far.
    pub fn digest(&self) -> Blake3Hash {
        Blake3Hash(*self.hasher.clone().finalize().as_bytes())
    }
}

impl Default for RollingHash {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RollingHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RollingHash({:?})", self.digest())
    }
}

/// An Ed25519 public key identifying a signer.
///
/// Text form: `signer_z<64 hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SignerId(pub [u8; 32]);

impl SignerId {
    const PREFIX: &'static str = "signer_z";

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.strip_prefix(Self::PREFIX)
            .and_then(decode_hex_array)
            .map(Self)
            .ok_or_else(|| CoreError::Malformed(format!("invalid signer id: {s}")))
    }

    /// Verify a signature over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl From<SignerId> for String {
    fn from(id: SignerId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SignerId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

/// A 64-byte Ed25519 signature.
///
/// Text form: `signature_z<128 hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Signature(pub [u8; 64]);

impl Signature {
    const PREFIX: &'static str = "signature_z";

    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.strip_prefix(Self::PREFIX)
            .and_then(decode_hex_array)
            .map(Self)
            .ok_or_else(|| CoreError::Malformed("invalid signature text".into()))
    }

    /// The zero signature (invalid, used as placeholder).
    pub const ZERO: Self = Self([0u8; 64]);
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.to_string()
    }
}

impl TryFrom<String> for Signature {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

/// Secret half of a signer.
#[derive(Clone)]
pub struct SignerSecret {
    signing_key: SigningKey,
}

impl SignerSecret {
    /// Generate a new random signer.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn signer_id(&self) -> SignerId {
        SignerId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerSecret({:?})", self.signer_id())
    }
}

/// Identifier of a symmetric read key. Text form: `key_z<32 hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    const PREFIX: &'static str = "key_z";

    pub fn parse(s: &str) -> Result<Self> {
        s.strip_prefix(Self::PREFIX)
            .and_then(decode_hex_array)
            .map(Self)
            .ok_or_else(|| CoreError::Malformed(format!("invalid key id: {s}")))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", hex::encode(self.0))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for KeyId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

/// A 256-bit symmetric read key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(pub [u8; 32]);

impl KeySecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Id derived from the key material, stable across peers.
    pub fn key_id(&self) -> KeyId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"covalue-key-id-v0:");
        hasher.update(&self.0);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        KeyId(id)
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret({:?})", self.key_id())
    }
}

/// Nonce input for a private payload: which transaction of which CoValue.
///
/// Binding the nonce to the transaction position means a ciphertext cannot
/// be replayed into another slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceMaterial {
    pub covalue: CoValueId,
    pub tx: TransactionId,
}

impl NonceMaterial {
    fn nonce(&self) -> [u8; 12] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"covalue-nonce-v0:");
        hasher.update(&self.covalue.0);
        hasher.update(self.tx.session.to_string().as_bytes());
        hasher.update(&self.tx.index.to_be_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
        nonce
    }
}

/// Signing, verification, encryption and hashing used by the log core.
pub trait CryptoProvider: Send + Sync {
    /// Sign a session hash.
    fn sign(&self, secret: &SignerSecret, hash: &Blake3Hash) -> Signature;

    /// Verify a session hash signature.
    fn verify(&self, signer: &SignerId, hash: &Blake3Hash, signature: &Signature) -> Result<()>;

    /// Derive the content address of a header.
    fn covalue_id(&self, header: &CoValueHeader) -> CoValueId;

    /// Start a fresh rolling hash for a session.
    fn rolling_hash(&self) -> RollingHash {
        RollingHash::new()
    }

    fn encrypt(&self, key: &KeySecret, plaintext: &[u8], nonce: &NonceMaterial) -> Result<Bytes>;

    fn decrypt(&self, key: &KeySecret, ciphertext: &[u8], nonce: &NonceMaterial)
        -> Result<Vec<u8>>;
}

/// Ed25519 + BLAKE3 + ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCrypto;

impl CryptoProvider for StandardCrypto {
    fn sign(&self, secret: &SignerSecret, hash: &Blake3Hash) -> Signature {
        secret.sign(hash.as_bytes())
    }

    fn verify(&self, signer: &SignerId, hash: &Blake3Hash, signature: &Signature) -> Result<()> {
        signer.verify(hash.as_bytes(), signature)
    }

    fn covalue_id(&self, header: &CoValueHeader) -> CoValueId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"covalue-header-v0:");
        hasher.update(&canonical_header_bytes(header));
        CoValueId(*hasher.finalize().as_bytes())
    }

    fn encrypt(&self, key: &KeySecret, plaintext: &[u8], nonce: &NonceMaterial) -> Result<Bytes> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce_bytes = nonce.nonce();
        cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map(Bytes::from)
            .map_err(|e| CoreError::EncodingError(format!("encryption failed: {e}")))
    }

    fn decrypt(
        &self,
        key: &KeySecret,
        ciphertext: &[u8],
        nonce: &NonceMaterial,
    ) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let nonce_bytes = nonce.nonce();
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext)
            .map_err(|e| CoreError::DecryptionFailed(e.to_string()))
    }
}
