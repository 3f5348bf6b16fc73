//! CBOR codec for sync messages.
//!
//! Limits are checked on both sides: an oversized message is never sent,
//! and a decoded one is rejected before it reaches the manager.

use crate::error::{Result, SyncError};
use crate::messages::{limits, SyncMessage};

/// Encode a message for the wire.
pub fn encode_message(message: &SyncMessage) -> Result<Vec<u8>> {
    message
        .validate_limits()
        .map_err(|e| SyncError::InvalidMessage(e.into()))?;

    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| SyncError::InvalidMessage(format!("encode failed: {e}")))?;
    if buf.len() > limits::MAX_MESSAGE_SIZE {
        return Err(SyncError::MessageTooLarge {
            size: buf.len(),
            limit: limits::MAX_MESSAGE_SIZE,
        });
    }
    Ok(buf)
}

/// Decode a message received from the wire.
pub fn decode_message(bytes: &[u8]) -> Result<SyncMessage> {
    if bytes.len() > limits::MAX_MESSAGE_SIZE {
        return Err(SyncError::MessageTooLarge {
            size: bytes.len(),
            limit: limits::MAX_MESSAGE_SIZE,
        });
    }
    let message: SyncMessage = ciborium::from_reader(bytes)
        .map_err(|e| SyncError::InvalidMessage(format!("decode failed: {e}")))?;
    message
        .validate_limits()
        .map_err(|e| SyncError::InvalidMessage(e.into()))?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{
        list_append, Author, CoValueHeader, CoValueType, CryptoProvider, LogConfig, Ruleset,
        SessionId, SignerSecret, StandardCrypto, Transaction, VerifiedState,
    };
    use serde_json::json;

    fn content() -> SyncMessage {
        let secret = SignerSecret::from_seed(&[4; 32]);
        let session = SessionId::new(Author::Agent(secret.signer_id()), [4; 8]);
        let header = CoValueHeader::new(CoValueType::List, Ruleset::UnsafeAllowAll);
        let id = StandardCrypto.covalue_id(&header);
        let mut log = VerifiedState::new(id, header, LogConfig::default());
        let tx = Transaction::trusting(&[list_append(json!("a"))], None, 1).unwrap();
        log.add_local_transaction(&StandardCrypto, session, &secret, tx);
        let mut pieces = log.new_content_since(None).unwrap();
        SyncMessage::Content(pieces.remove(0))
    }

    #[test]
    fn test_content_survives_the_wire() {
        let message = content();
        let bytes = encode_message(&message).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), message);
    }

    #[test]
    fn test_oversized_input_rejected() {
        let bytes = vec![0u8; limits::MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            decode_message(&bytes),
            Err(SyncError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_message(&[0xff, 0x00, 0x13]),
            Err(SyncError::InvalidMessage(_))
        ));
    }
}
