//! Node identity
//!
//! An `Identity` holds an Ed25519 signing key; its `Address` is the first
//! 20 bytes of the BLAKE3 hash of the verifying key. `PublicIdentity` is
//! the shareable half used by peers to verify signed payloads.

use ed25519_dalek::{
    Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, CryptoResult};
use crate::{ADDRESS_SIZE, PUBKEY_SIZE, SIGNATURE_SIZE};

/// A 160-bit participant address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    bytes: [u8; ADDRESS_SIZE],
}

/// Ed25519 signature
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// A node's signing identity
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    signing_key: SigningKey,

    /// Cached address
    #[zeroize(skip)]
    address: Address,
}

/// Public identity information (shareable)
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct PublicIdentity {
    /// Participant address
    pub address: Address,

    /// Ed25519 public key for verifying signatures
    pub signing_pubkey: [u8; PUBKEY_SIZE],
}

impl Address {
    /// Create an address from raw bytes
    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self { bytes }
    }

    /// Derive an address from a public signing key
    pub fn from_pubkey(pubkey: &[u8; PUBKEY_SIZE]) -> Self {
        let hash = blake3::hash(pubkey);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&hash.as_bytes()[..ADDRESS_SIZE]);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.bytes
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex_encode(&self.bytes)
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> CryptoResult<Self> {
        let bytes = hex_decode(hex)?;
        if bytes.len() != ADDRESS_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: ADDRESS_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ADDRESS_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self { bytes: arr })
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: SIGNATURE_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", &hex_encode(&self.bytes)[..8])
    }
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = Address::from_pubkey(&signing_key.verifying_key().to_bytes());

        Self {
            signing_key,
            address,
        }
    }

    /// Restore an identity from its secret key bytes
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let address = Address::from_pubkey(&signing_key.verifying_key().to_bytes());

        Self {
            signing_key,
            address,
        }
    }

    /// Get the participant address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Get the Ed25519 verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature {
            bytes: sig.to_bytes(),
        }
    }

    /// Export public information
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            address: self.address,
            signing_pubkey: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Export the secret key for secure storage
    pub fn export_secret(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self::from_secret(self.export_secret())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.address)
    }
}

impl PublicIdentity {
    /// Verify a signature from this identity
    pub fn verify(&self, message: &[u8], signature: &Signature) -> CryptoResult<()> {
        let verifying_key = VerifyingKey::from_bytes(&self.signing_pubkey)
            .map_err(|_| CryptoError::InvalidPublicKey)?;

        let sig = Ed25519Sig::from_bytes(signature.as_bytes());

        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }

    /// Check that the claimed address matches the public key
    pub fn address_matches(&self) -> bool {
        Address::from_pubkey(&self.signing_pubkey) == self.address
    }
}

// Helper functions for hex encoding/decoding
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> CryptoResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(CryptoError::EncodingError("Invalid hex length".into()));
    }

    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CryptoError::EncodingError("Invalid hex character".into()))
        })
        .collect()
}
