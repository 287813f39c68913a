//! Consumer connection lifecycle

mod manager;
mod status;

pub use manager::{
    default_payment_factory, BrokerDialogCreator, ConnectionManager, DialogCreator,
    PaymentIssuerFactory,
};
pub use status::{ConnectParams, ConnectionStatus};
