//! Authenticated message envelope
//!
//! Every dialog payload travels wrapped in an `Envelope`: the sender's
//! public identity, the raw JSON payload bytes, and an Ed25519 signature
//! over those bytes. The recipient verifies the signature and that the
//! claimed address really belongs to the embedded public key before the
//! payload is handed to any handler.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tollgate_crypto::{Address, Identity, PublicIdentity, Signature};

use crate::error::{NetworkError, NetworkResult};

/// Signed wrapper around a JSON payload
#[derive(Serialize, Deserialize)]
pub struct Envelope {
    /// Claimed sender
    pub sender: PublicIdentity,

    /// Raw payload bytes (JSON), base64 on the wire
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,

    /// Signature over `payload`
    pub signature: Signature,
}

/// Serialize `payload` to JSON, sign it, and encode the envelope
pub fn seal<T: Serialize>(identity: &Identity, payload: &T) -> NetworkResult<Bytes> {
    let payload =
        serde_json::to_vec(payload).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    let signature = identity.sign(&payload);

    let envelope = Envelope {
        sender: identity.public(),
        payload,
        signature,
    };
    let bytes =
        serde_json::to_vec(&envelope).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    Ok(Bytes::from(bytes))
}

/// Decode and verify an envelope, returning the sender and typed payload
///
/// When `expected_sender` is given, a mismatching sender is rejected even
/// if the signature itself is valid.
pub fn open<T: DeserializeOwned>(
    data: &[u8],
    expected_sender: Option<Address>,
) -> NetworkResult<(PublicIdentity, T)> {
    let envelope: Envelope =
        serde_json::from_slice(data).map_err(|e| NetworkError::Serialization(e.to_string()))?;

    if !envelope.sender.address_matches() {
        return Err(NetworkError::SignatureInvalid);
    }

    envelope
        .sender
        .verify(&envelope.payload, &envelope.signature)
        .map_err(|_| NetworkError::SignatureInvalid)?;

    if let Some(expected) = expected_sender {
        if envelope.sender.address != expected {
            return Err(NetworkError::IdentityMismatch {
                expected: expected.to_hex(),
                actual: envelope.sender.address.to_hex(),
            });
        }
    }

    let payload = serde_json::from_slice(&envelope.payload)
        .map_err(|e| NetworkError::Serialization(e.to_string()))?;
    Ok((envelope.sender, payload))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
