//! Payment rails settle one leg of a swap on a payment network.
//!
//! A rail is either an HTLC-invoice network ([`htlc`]) or a
//! conditional-transfer network ([`transfer`]). Both offer the same
//! capabilities to the swap engine: create and decode payment requests, pay
//! them, report capacity and settle payments locked to our own requests.

pub mod htlc;
pub mod transfer;

use crate::{
    asset::{Amount, Currency},
    Secret, SecretHash,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque payment request produced by a rail client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayRequest(String);

impl PayRequest {
    pub fn new(request: impl Into<String>) -> Self {
        PayRequest(request.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for PayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub currency: Currency,
    pub amount: Amount,
    pub secret_hash: SecretHash,
    pub destination: String,
}

/// A payment locked to one of our payment requests, waiting to be settled
/// with the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPayment {
    pub currency: Currency,
    pub secret_hash: SecretHash,
    pub amount: Amount,
    pub settlement: Settlement,
}

/// How an incoming payment is claimed on its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Settle the hold invoice of the payment's hash lock.
    Htlc,
    /// Resolve the conditional transfer.
    Transfer(transfer::TransferId),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RailKind {
    Htlc,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid invoice: {0}")]
pub struct InvoiceDecodeError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payment failed: {0}")]
pub struct PaymentFailed(pub String);

#[derive(Debug, thiserror::Error)]
pub enum RailError {
    #[error("payment network daemon failed: {0:#}")]
    Daemon(anyhow::Error),
    #[error("{0:?} settlement cannot be used on a {1} rail")]
    ForeignSettlement(Settlement, RailKind),
}

/// The rail client responsible for one currency.
#[derive(Debug)]
pub enum RailClient {
    Htlc(htlc::Client),
    Transfer(transfer::Client),
}

impl RailClient {
    pub fn kind(&self) -> RailKind {
        match self {
            RailClient::Htlc(_) => RailKind::Htlc,
            RailClient::Transfer(_) => RailKind::Transfer,
        }
    }

    pub fn currency(&self) -> &Currency {
        match self {
            RailClient::Htlc(client) => client.currency(),
            RailClient::Transfer(client) => client.currency(),
        }
    }

    /// Produces a payment request for `amount` that can only be claimed by
    /// revealing the preimage of `secret_hash`.
    pub async fn create_invoice(
        &self,
        amount: Amount,
        secret_hash: SecretHash,
        purpose: &str,
    ) -> Result<PayRequest, RailError> {
        match self {
            RailClient::Htlc(client) => client.create_invoice(amount, secret_hash, purpose).await,
            RailClient::Transfer(client) => {
                client.create_invoice(amount, secret_hash, purpose).await
            }
        }
    }

    pub fn decode_invoice(&self, request: &PayRequest) -> Result<DecodedInvoice, InvoiceDecodeError> {
        match self {
            RailClient::Htlc(client) => client.decode_invoice(request),
            RailClient::Transfer(client) => client.decode_invoice(request),
        }
    }

    /// Pays `request` and returns the preimage revealed by the payee.
    ///
    /// The returned secret is guaranteed to unlock the request's hash lock.
    pub async fn pay(&self, request: &PayRequest) -> Result<Secret, PaymentFailed> {
        match self {
            RailClient::Htlc(client) => client.pay(request).await,
            RailClient::Transfer(client) => client.pay(request).await,
        }
    }

    /// Advisory upper bound of what can currently be paid on this rail.
    pub async fn active_capacity(&self) -> Result<Amount, RailError> {
        match self {
            RailClient::Htlc(client) => client.active_capacity().await,
            RailClient::Transfer(client) => client.active_capacity().await,
        }
    }

    pub async fn incoming(&self) -> Result<BoxStream<'static, IncomingPayment>, RailError> {
        match self {
            RailClient::Htlc(client) => client.incoming().await,
            RailClient::Transfer(client) => client.incoming().await,
        }
    }

    /// Claims an incoming payment by revealing `secret` to the payer.
    pub async fn settle(&self, payment: &IncomingPayment, secret: Secret) -> Result<(), RailError> {
        match (self, payment.settlement) {
            (RailClient::Htlc(client), Settlement::Htlc) => client.settle(secret).await,
            (RailClient::Transfer(client), Settlement::Transfer(id)) => {
                client.resolve(id, secret).await
            }
            (client, settlement) => Err(RailError::ForeignSettlement(settlement, client.kind())),
        }
    }

    /// Withdraws one of our payment requests that will never be claimed.
    ///
    /// Transfer records are not registered anywhere, so there is nothing to
    /// withdraw on a transfer rail.
    pub async fn cancel_invoice(&self, secret_hash: SecretHash) -> Result<(), RailError> {
        match self {
            RailClient::Htlc(client) => client.cancel_invoice(secret_hash).await,
            RailClient::Transfer(_) => Ok(()),
        }
    }
}

fn verify_preimage(secret: Secret, secret_hash: &SecretHash) -> Result<Secret, PaymentFailed> {
    if !secret.unlocks(secret_hash) {
        return Err(PaymentFailed(format!(
            "revealed preimage does not hash to {}",
            secret_hash
        )));
    }

    Ok(secret)
}
