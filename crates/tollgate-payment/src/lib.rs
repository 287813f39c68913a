//! Micropayment exchange
//!
//! The provider periodically tells the consumer what it owes
//! (`BalanceMessage`); the consumer answers with a signed `Promise` for
//! that amount. The provider-side validator enforces strictly increasing
//! sequence ids and non-decreasing amounts; accumulated promises are handed
//! to an out-of-scope settlement subsystem.

pub mod error;
pub mod issuer;
pub mod processor;
pub mod promise;

pub use error::{PaymentError, PaymentResult};
pub use issuer::{IssuerConfig, PaymentIssuer, PromiseSink};
pub use processor::{BillingConfig, PromiseValidator, PromiseValidatorHandler};
pub use promise::{BalanceMessage, Promise, PromiseState, TOPIC_BALANCE, TOPIC_PROMISE};
