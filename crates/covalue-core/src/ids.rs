//! Identifier newtypes.
//!
//! Every identifier has a stable text form, which is also its serde
//! representation so that ids can key maps in both CBOR and JSON.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::SignerId;
use crate::error::CoreError;

/// Decode a fixed-size byte array from hex.
pub(crate) fn decode_hex_array<const N: usize>(s: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Content-addressed CoValue identifier: the BLAKE3 hash of the canonical header.
///
/// Text form: `co_z<64 hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CoValueId(pub [u8; 32]);

impl CoValueId {
    const PREFIX: &'static str = "co_z";

    /// Create a new id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the text form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        s.strip_prefix(Self::PREFIX)
            .and_then(decode_hex_array)
            .map(Self)
            .ok_or_else(|| CoreError::Malformed(format!("invalid CoValue id: {s}")))
    }
}

impl fmt::Debug for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoValueId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for CoValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.to_hex())
    }
}

impl FromStr for CoValueId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<CoValueId> for String {
    fn from(id: CoValueId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CoValueId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl AsRef<[u8]> for CoValueId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for CoValueId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Who writes a session: a bare agent key, or an account CoValue whose
/// signer has to be resolved first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Author {
    Agent(SignerId),
    Account(CoValueId),
}

impl Author {
    /// The account id, if this author needs resolution.
    pub fn account(&self) -> Option<&CoValueId> {
        match self {
            Author::Account(id) => Some(id),
            Author::Agent(_) => None,
        }
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Agent(signer) => write!(f, "Agent({:?})", signer),
            Author::Account(id) => write!(f, "Account({:?})", id),
        }
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Author::Agent(signer) => write!(f, "{}", signer),
            Author::Account(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Author {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(CoValueId::PREFIX) {
            CoValueId::parse(s).map(Author::Account)
        } else {
            SignerId::parse(s).map(Author::Agent)
        }
    }
}

impl From<Author> for String {
    fn from(author: Author) -> Self {
        author.to_string()
    }
}

impl TryFrom<String> for Author {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One writer session within a CoValue.
///
/// Text form: `<author>_session_z<16 hex chars>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionId {
    author: Author,
    tag: [u8; 8],
}

impl SessionId {
    const SEPARATOR: &'static str = "_session_z";

    /// Create a session with an explicit tag.
    pub const fn new(author: Author, tag: [u8; 8]) -> Self {
        Self { author, tag }
    }

    /// Create a fresh session with a random tag.
    pub fn random(author: Author) -> Self {
        let mut tag = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut tag);
        Self { author, tag }
    }

    /// The author writing this session.
    pub fn author(&self) -> &Author {
        &self.author
    }

    /// Parse the text form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (author, tag) = s
            .rsplit_once(Self::SEPARATOR)
            .ok_or_else(|| CoreError::Malformed(format!("invalid session id: {s}")))?;
        let tag = decode_hex_array(tag)
            .ok_or_else(|| CoreError::Malformed(format!("invalid session tag: {s}")))?;
        Ok(Self {
            author: author.parse()?,
            tag,
        })
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:?}/{})", self.author, hex::encode(self.tag))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.author, Self::SEPARATOR, hex::encode(self.tag))
    }
}

impl FromStr for SessionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SessionId {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

/// Position of one transaction: session plus index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub session: SessionId,
    pub index: u32,
}

impl TransactionId {
    pub const fn new(session: SessionId, index: u32) -> Self {
        Self { session, index }
    }
}

/// Name of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignerSecret;

    #[test]
    fn test_covalue_id_text_roundtrip() {
        let id = CoValueId::from_bytes([0x42; 32]);
        let text = id.to_string();
        assert!(text.starts_with("co_z"));
        assert_eq!(CoValueId::parse(&text).unwrap(), id);
    }

    #[test]
    fn test_covalue_id_rejects_bad_prefix() {
        let text = format!("xx_z{}", hex::encode([1u8; 32]));
        assert!(CoValueId::parse(&text).is_err());
        assert!(CoValueId::parse("co_zabc").is_err());
    }

    #[test]
    fn test_covalue_id_debug() {
        let id = CoValueId::from_bytes([0xcd; 32]);
        assert_eq!(format!("{:?}", id), "CoValueId(cdcdcdcdcdcdcdcd)");
    }

    #[test]
    fn test_session_id_roundtrip_agent() {
        let signer = SignerSecret::from_seed(&[7; 32]).signer_id();
        let session = SessionId::new(Author::Agent(signer), [1, 2, 3, 4, 5, 6, 7, 8]);
        let text = session.to_string();
        assert!(text.contains("_session_z0102030405060708"));
        assert_eq!(SessionId::parse(&text).unwrap(), session);
    }

    #[test]
    fn test_session_id_roundtrip_account() {
        let account = CoValueId::from_bytes([9; 32]);
        let session = SessionId::random(Author::Account(account));
        let parsed: SessionId = session.to_string().parse().unwrap();
        assert_eq!(parsed, session);
        assert_eq!(parsed.author().account(), Some(&account));
    }

    #[test]
    fn test_session_id_serde_as_string() {
        let session = SessionId::new(Author::Account(CoValueId::from_bytes([3; 32])), [0; 8]);
        let json = serde_json::to_string(&session).unwrap();
        assert_eq!(json, format!("\"{}\"", session));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
