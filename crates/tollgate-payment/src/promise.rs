//! Promises and balance messages
//!
//! A promise is a signed IOU from the consumer for the accumulated amount
//! the provider has asked for. Sequence ids increase strictly per dialog;
//! amounts never decrease.

use serde::{Deserialize, Serialize};
use tollgate_crypto::{Identity, PublicIdentity, Signature};

use crate::error::{PaymentError, PaymentResult};

/// Dialog topic for provider→consumer balance messages
pub const TOPIC_BALANCE: &str = "balance";

/// Dialog topic for consumer→provider promises
pub const TOPIC_PROMISE: &str = "promise";

/// Canonical byte image that gets signed
#[derive(Serialize)]
struct PromiseBody {
    amount: u64,
    sequence_id: u64,
}

fn body_bytes(amount: u64, sequence_id: u64) -> PaymentResult<Vec<u8>> {
    bincode::serialize(&PromiseBody {
        amount,
        sequence_id,
    })
    .map_err(|e| PaymentError::Serialization(e.to_string()))
}

/// A signed IOU for a cumulative amount
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promise {
    pub amount: u64,
    pub sequence_id: u64,
    pub signature: Signature,
}

impl Promise {
    /// Sign a promise with the consumer identity
    pub fn issue(identity: &Identity, amount: u64, sequence_id: u64) -> PaymentResult<Self> {
        let signature = identity.sign(&body_bytes(amount, sequence_id)?);
        Ok(Self {
            amount,
            sequence_id,
            signature,
        })
    }

    /// Verify the signature against the issuing identity
    pub fn verify(&self, issuer: &PublicIdentity) -> PaymentResult<()> {
        let bytes = body_bytes(self.amount, self.sequence_id)?;
        issuer
            .verify(&bytes, &self.signature)
            .map_err(|_| PaymentError::BadPromise("invalid signature".into()))
    }
}

/// Provider→consumer statement of the amount owed
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BalanceMessage {
    pub sequence_id: u64,
    pub amount: u64,
}

/// Last (amount, sequence) pair a side has settled on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseState {
    pub amount: u64,
    pub sequence_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let consumer = Identity::generate();
        let promise = Promise::issue(&consumer, 100, 1).unwrap();

        assert!(promise.verify(&consumer.public()).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_identity() {
        let consumer = Identity::generate();
        let other = Identity::generate();
        let promise = Promise::issue(&consumer, 100, 1).unwrap();

        assert!(matches!(
            promise.verify(&other.public()),
            Err(PaymentError::BadPromise(_))
        ));
    }

    #[test]
    fn test_verify_rejects_altered_amount() {
        let consumer = Identity::generate();
        let mut promise = Promise::issue(&consumer, 100, 1).unwrap();
        promise.amount = 1;

        assert!(promise.verify(&consumer.public()).is_err());
    }

    #[test]
    fn test_wire_roundtrip() {
        let consumer = Identity::generate();
        let promise = Promise::issue(&consumer, 250, 7).unwrap();

        let json = serde_json::to_string(&promise).unwrap();
        let restored: Promise = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.amount, 250);
        assert_eq!(restored.sequence_id, 7);
        assert!(restored.verify(&consumer.public()).is_ok());
    }
}
