//! Key wrap envelope codec
//!
//! Every archived secret is persisted as
//!
//! ```text
//! SEQUENCE {
//!     encryptedSessionKey OCTET STRING,
//!     encryptedPayload    OCTET STRING
//! }
//! ```
//!
//! encoded in DER. The codec only shapes bytes; it knows nothing about the
//! algorithms that produced them.

use der::{asn1::OctetString, Decode, Encode, Sequence};

use crate::error::{KraError, Result};

/// Wrapped session key plus the payload encrypted under that session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeyEnvelope {
    pub encrypted_session_key: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

#[derive(Sequence)]
struct EnvelopeDer {
    encrypted_session_key: OctetString,
    encrypted_payload: OctetString,
}

impl WrappedKeyEnvelope {
    pub fn new(encrypted_session_key: Vec<u8>, encrypted_payload: Vec<u8>) -> Self {
        WrappedKeyEnvelope {
            encrypted_session_key,
            encrypted_payload,
        }
    }

    /// Encode as DER
    pub fn to_der(&self) -> Result<Vec<u8>> {
        encode(&self.encrypted_session_key, &self.encrypted_payload)
    }

    /// Decode from DER; see [`decode`]
    pub fn from_der(blob: &[u8]) -> Result<Self> {
        decode(blob)
    }
}

/// Build the DER envelope from its two components
pub fn encode(session_wrapped: &[u8], payload_encrypted: &[u8]) -> Result<Vec<u8>> {
    let value = EnvelopeDer {
        encrypted_session_key: octet_string(session_wrapped)?,
        encrypted_payload: octet_string(payload_encrypted)?,
    };
    value
        .to_der()
        .map_err(|e| KraError::MalformedEnvelope(format!("encoding failed: {}", e)))
}

/// Parse a DER envelope
///
/// Fails with [`KraError::MalformedEnvelope`] unless `blob` is exactly one
/// two-element sequence of octet strings with no trailing bytes.
pub fn decode(blob: &[u8]) -> Result<WrappedKeyEnvelope> {
    let value =
        EnvelopeDer::from_der(blob).map_err(|e| KraError::MalformedEnvelope(e.to_string()))?;
    Ok(WrappedKeyEnvelope {
        encrypted_session_key: value.encrypted_session_key.as_bytes().to_vec(),
        encrypted_payload: value.encrypted_payload.as_bytes().to_vec(),
    })
}

fn octet_string(bytes: &[u8]) -> Result<OctetString> {
    OctetString::new(bytes.to_vec())
        .map_err(|e| KraError::MalformedEnvelope(format!("octet string too long: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_encoding() {
        let blob = encode(&[0x01, 0x02], &[0xAA]).unwrap();
        assert_eq!(
            blob,
            vec![0x30, 0x07, 0x04, 0x02, 0x01, 0x02, 0x04, 0x01, 0xAA]
        );
    }

    #[test]
    fn test_empty_fields() {
        let blob = encode(&[], &[]).unwrap();
        assert_eq!(blob, vec![0x30, 0x04, 0x04, 0x00, 0x04, 0x00]);
        let envelope = decode(&blob).unwrap();
        assert!(envelope.encrypted_session_key.is_empty());
        assert!(envelope.encrypted_payload.is_empty());
    }

    #[test]
    fn test_long_form_length() {
        let session = vec![0x5A; 256];
        let payload = vec![0xC3; 1000];
        let blob = encode(&session, &payload).unwrap();
        // SEQUENCE with two-byte long-form length
        assert_eq!(&blob[..2], &[0x30, 0x82]);
        let envelope = decode(&blob).unwrap();
        assert_eq!(envelope.encrypted_session_key, session);
        assert_eq!(envelope.encrypted_payload, payload);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut blob = encode(b"key", b"payload").unwrap();
        blob.push(0x00);
        assert!(matches!(decode(&blob), Err(KraError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_wrong_shapes_rejected() {
        // single octet string in the sequence
        let one = [0x30, 0x03, 0x04, 0x01, 0xFF];
        assert!(matches!(decode(&one), Err(KraError::MalformedEnvelope(_))));

        // three octet strings
        let three = [0x30, 0x06, 0x04, 0x00, 0x04, 0x00, 0x04, 0x00];
        assert!(matches!(decode(&three), Err(KraError::MalformedEnvelope(_))));

        // integer where an octet string belongs
        let int = [0x30, 0x05, 0x02, 0x01, 0x01, 0x04, 0x00];
        assert!(matches!(decode(&int), Err(KraError::MalformedEnvelope(_))));

        // not a sequence
        let bare = [0x04, 0x00];
        assert!(matches!(decode(&bare), Err(KraError::MalformedEnvelope(_))));

        assert!(matches!(decode(&[]), Err(KraError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_non_minimal_length_rejected() {
        // length 3 written in long form
        let blob = [0x30, 0x81, 0x04, 0x04, 0x00, 0x04, 0x00];
        assert!(matches!(decode(&blob), Err(KraError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_struct_helpers() {
        let envelope = WrappedKeyEnvelope::new(vec![1, 2, 3], vec![4, 5]);
        let blob = envelope.to_der().unwrap();
        assert_eq!(WrappedKeyEnvelope::from_der(&blob).unwrap(), envelope);
    }

    proptest! {
        #[test]
        fn prop_envelope_round_trip(
            a in proptest::collection::vec(any::<u8>(), 0..600),
            b in proptest::collection::vec(any::<u8>(), 0..2048),
        ) {
            let blob = encode(&a, &b).unwrap();
            let envelope = decode(&blob).unwrap();
            prop_assert_eq!(envelope.encrypted_session_key, a);
            prop_assert_eq!(envelope.encrypted_payload, b);
        }
    }
}
