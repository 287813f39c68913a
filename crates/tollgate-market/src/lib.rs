//! Service marketplace data model
//!
//! A provider advertises a `Proposal`: one service type, reachable through
//! the listed contacts, billed by the attached payment method. Proposals are
//! immutable once announced; the discovery registry that stores and matches
//! them lives outside this workspace.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tollgate_crypto::Address;

/// Contact kind for broker-backed dialogs
pub const CONTACT_BROKER_V1: &str = "broker/v1";

/// How to reach a provider over the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Contact kind (e.g. `broker/v1`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Kind-specific definition (for `broker/v1`: `{"topic": ...}`)
    pub definition: serde_json::Value,
}

impl Contact {
    /// Build a broker contact for the given topic
    pub fn broker(topic: &str) -> Self {
        Self {
            kind: CONTACT_BROKER_V1.to_string(),
            definition: serde_json::json!({ "topic": topic }),
        }
    }

    /// Extract the broker topic, if this is a broker contact
    pub fn broker_topic(&self) -> Option<&str> {
        if self.kind != CONTACT_BROKER_V1 {
            return None;
        }
        self.definition.get("topic").and_then(|t| t.as_str())
    }
}

/// Billing terms for a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethod {
    /// Price accrued per billing interval, in atomic token units
    pub price_per_interval: u64,

    /// Billing interval
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for PaymentMethod {
    fn default() -> Self {
        Self {
            price_per_interval: 50,
            interval: Duration::from_secs(60),
        }
    }
}

/// Coarse provider location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// A provider's advertised offer to serve one service type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Proposal identifier, unique per provider
    pub id: i64,

    /// Provider identity
    pub provider_id: Address,

    /// Service type offered (e.g. `"tunnel"`, `"noop"`)
    pub service_type: String,

    /// Ordered contact list; consumers dial the first entry
    pub provider_contacts: Vec<Contact>,

    /// Billing terms
    pub payment_method: PaymentMethod,

    /// Provider location
    pub location: Location,
}

impl Proposal {
    /// First contact, the one consumers dial
    pub fn primary_contact(&self) -> Option<&Contact> {
        self.provider_contacts.first()
    }

    /// Attach the reachable contact reported by the dialog waiter
    pub fn with_contact(mut self, contact: Contact) -> Self {
        self.provider_contacts = vec![contact];
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
