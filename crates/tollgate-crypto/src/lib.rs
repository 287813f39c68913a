//! Identity primitives for tollgate nodes
//!
//! Every participant is known by a 160-bit address derived from its
//! Ed25519 public key. The rest of the system only ever asks an identity
//! to sign bytes, or a public identity to verify them.

pub mod error;
pub mod identity;

pub use error::{CryptoError, CryptoResult};
pub use identity::{Address, Identity, PublicIdentity, Signature};

/// Address length in bytes (truncated BLAKE3 of the signing key)
pub const ADDRESS_SIZE: usize = 20;

/// Ed25519 public key length
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_SIZE: usize = 64;
