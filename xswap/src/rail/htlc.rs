//! HTLC-invoice rail: hold invoices on a Lightning-style network.
//!
//! The payee adds a hold invoice for the hash lock. The payer's HTLC is
//! accepted but not settled until the payee releases the preimage, at which
//! point the payer's `send_payment` resolves with it.

use crate::{
    asset::{Amount, Currency},
    network::{Network, NodeContext},
    rail::{
        verify_preimage, DecodedInvoice, IncomingPayment, InvoiceDecodeError, PayRequest,
        PaymentFailed, RailError, Settlement,
    },
    Secret, SecretHash,
};
use futures::{stream::BoxStream, StreamExt};
use std::{fmt::Debug, sync::Arc};

const PREFIX: &str = "lnx1";

/// The subset of a Lightning daemon used by the rail.
#[async_trait::async_trait]
pub trait LightningNode: Debug + Send + Sync + 'static {
    /// The public key payments are routed to.
    fn identity(&self) -> String;

    async fn add_hold_invoice(
        &self,
        secret_hash: SecretHash,
        amount: Amount,
        memo: &str,
    ) -> anyhow::Result<()>;

    async fn settle_invoice(&self, secret: Secret) -> anyhow::Result<()>;

    /// Cancels a hold invoice, failing back an HTLC that is held for it.
    async fn cancel_invoice(&self, secret_hash: SecretHash) -> anyhow::Result<()>;

    /// Resolves once the payee settled the HTLC.
    async fn send_payment(
        &self,
        destination: &str,
        secret_hash: SecretHash,
        amount: Amount,
    ) -> anyhow::Result<Secret>;

    async fn channel_balance(&self) -> anyhow::Result<Amount>;

    /// HTLCs accepted for our hold invoices.
    async fn subscribe_htlcs(&self) -> anyhow::Result<BoxStream<'static, AcceptedHtlc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedHtlc {
    pub secret_hash: SecretHash,
    pub amount: Amount,
}

/// The decoded form of an HTLC pay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub network: Network,
    pub currency: Currency,
    pub amount: Amount,
    pub secret_hash: SecretHash,
    pub destination: String,
    pub memo: String,
}

impl Invoice {
    pub fn encode(&self) -> PayRequest {
        PayRequest::new(format!(
            "{}:{}:{}:{}:{:x}:{}:{}",
            PREFIX,
            self.network,
            self.currency,
            self.amount,
            self.secret_hash,
            hex::encode(&self.destination),
            hex::encode(&self.memo)
        ))
    }

    pub fn decode(request: &PayRequest) -> Result<Invoice, InvoiceDecodeError> {
        let fields = request.as_str().split(':').collect::<Vec<_>>();

        let (network, currency, amount, secret_hash, destination, memo) = match fields.as_slice() {
            [PREFIX, network, currency, amount, secret_hash, destination, memo] => {
                (network, currency, amount, secret_hash, destination, memo)
            }
            _ => return Err(InvoiceDecodeError("not an HTLC pay request".to_owned())),
        };

        Ok(Invoice {
            network: network
                .parse()
                .map_err(|_| InvoiceDecodeError(format!("unknown network '{}'", network)))?,
            currency: currency
                .parse()
                .map_err(|e| InvoiceDecodeError(format!("{}", e)))?,
            amount: amount
                .parse()
                .map_err(|_| InvoiceDecodeError(format!("invalid amount '{}'", amount)))?,
            secret_hash: secret_hash
                .parse()
                .map_err(|e| InvoiceDecodeError(format!("invalid hash lock: {}", e)))?,
            destination: decode_text(destination)?,
            memo: decode_text(memo)?,
        })
    }
}

fn decode_text(field: &str) -> Result<String, InvoiceDecodeError> {
    let bytes = hex::decode(field).map_err(|e| InvoiceDecodeError(format!("{}", e)))?;

    String::from_utf8(bytes).map_err(|e| InvoiceDecodeError(format!("{}", e)))
}

#[derive(Debug, Clone)]
pub struct Client {
    currency: Currency,
    network: Network,
    node: Arc<dyn LightningNode>,
}

impl Client {
    pub fn new(currency: Currency, context: &NodeContext, node: Arc<dyn LightningNode>) -> Self {
        Client {
            currency,
            network: context.network,
            node,
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub async fn create_invoice(
        &self,
        amount: Amount,
        secret_hash: SecretHash,
        purpose: &str,
    ) -> Result<PayRequest, RailError> {
        self.node
            .add_hold_invoice(secret_hash, amount, purpose)
            .await
            .map_err(RailError::Daemon)?;

        let invoice = Invoice {
            network: self.network,
            currency: self.currency.clone(),
            amount,
            secret_hash,
            destination: self.node.identity(),
            memo: purpose.to_owned(),
        };

        Ok(invoice.encode())
    }

    pub fn decode_invoice(&self, request: &PayRequest) -> Result<DecodedInvoice, InvoiceDecodeError> {
        let invoice = Invoice::decode(request)?;

        if invoice.network != self.network {
            return Err(InvoiceDecodeError(format!(
                "invoice is for {} network, we are on {}",
                invoice.network, self.network
            )));
        }
        if invoice.currency != self.currency {
            return Err(InvoiceDecodeError(format!(
                "invoice is denominated in {}, expected {}",
                invoice.currency, self.currency
            )));
        }

        Ok(DecodedInvoice {
            currency: invoice.currency,
            amount: invoice.amount,
            secret_hash: invoice.secret_hash,
            destination: invoice.destination,
        })
    }

    pub async fn pay(&self, request: &PayRequest) -> Result<Secret, PaymentFailed> {
        let invoice = self
            .decode_invoice(request)
            .map_err(|e| PaymentFailed(e.to_string()))?;

        let secret = self
            .node
            .send_payment(&invoice.destination, invoice.secret_hash, invoice.amount)
            .await
            .map_err(|e| PaymentFailed(format!("{:#}", e)))?;

        verify_preimage(secret, &invoice.secret_hash)
    }

    pub async fn active_capacity(&self) -> Result<Amount, RailError> {
        self.node.channel_balance().await.map_err(RailError::Daemon)
    }

    pub async fn incoming(&self) -> Result<BoxStream<'static, IncomingPayment>, RailError> {
        let currency = self.currency.clone();
        let htlcs = self
            .node
            .subscribe_htlcs()
            .await
            .map_err(RailError::Daemon)?;

        Ok(htlcs
            .map(move |htlc| IncomingPayment {
                currency: currency.clone(),
                secret_hash: htlc.secret_hash,
                amount: htlc.amount,
                settlement: Settlement::Htlc,
            })
            .boxed())
    }

    pub async fn settle(&self, secret: Secret) -> Result<(), RailError> {
        self.node
            .settle_invoice(secret)
            .await
            .map_err(RailError::Daemon)
    }

    pub async fn cancel_invoice(&self, secret_hash: SecretHash) -> Result<(), RailError> {
        self.node
            .cancel_invoice(secret_hash)
            .await
            .map_err(RailError::Daemon)
    }
}
