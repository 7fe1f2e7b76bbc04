//! Conditional-transfer rail on a generalized state-channel network.
//!
//! The payer creates a transfer locked to the hash lock which the recipient
//! resolves with the preimage. Paying a request therefore means creating the
//! transfer and waiting for its resolution.

use crate::{
    asset::{Amount, Currency},
    network::{Network, NodeContext},
    rail::{
        verify_preimage, DecodedInvoice, IncomingPayment, InvoiceDecodeError, PayRequest,
        PaymentFailed, RailError, Settlement,
    },
    Secret, SecretHash,
};
use futures::{future, stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{fmt, fmt::Debug, sync::Arc};
use uuid::Uuid;

const PREFIX: &str = "xfer1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn random() -> Self {
        TransferId(Uuid::new_v4())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The subset of a state-channel daemon used by the rail.
#[async_trait::async_trait]
pub trait TransferNode: Debug + Send + Sync + 'static {
    fn public_identifier(&self) -> String;

    async fn create_conditional_transfer(
        &self,
        recipient: &str,
        asset: &Currency,
        amount: Amount,
        lock_hash: SecretHash,
    ) -> anyhow::Result<TransferId>;

    async fn resolve_transfer(&self, transfer_id: TransferId, secret: Secret) -> anyhow::Result<()>;

    /// Resolves once the recipient resolved the transfer.
    async fn transfer_resolved(&self, transfer_id: TransferId) -> anyhow::Result<Secret>;

    async fn free_balance(&self, asset: &Currency) -> anyhow::Result<Amount>;

    /// Conditional transfers addressed to us that await resolution.
    async fn subscribe_transfers(&self) -> anyhow::Result<BoxStream<'static, PendingTransfer>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub transfer_id: TransferId,
    pub asset: Currency,
    pub amount: Amount,
    pub lock_hash: SecretHash,
}

/// What a transfer pay request describes: the transfer the payer must create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub network: Network,
    pub asset: Currency,
    pub amount: Amount,
    pub lock_hash: SecretHash,
    pub recipient: String,
    pub purpose: String,
}

impl TransferRecord {
    pub fn encode(&self) -> Result<PayRequest, serde_json::Error> {
        let json = serde_json::to_vec(self)?;

        Ok(PayRequest::new(format!("{}{}", PREFIX, hex::encode(json))))
    }

    pub fn decode(request: &PayRequest) -> Result<TransferRecord, InvoiceDecodeError> {
        let payload = request
            .as_str()
            .strip_prefix(PREFIX)
            .ok_or_else(|| InvoiceDecodeError("not a transfer pay request".to_owned()))?;
        let json = hex::decode(payload).map_err(|e| InvoiceDecodeError(e.to_string()))?;

        serde_json::from_slice(&json).map_err(|e| InvoiceDecodeError(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    currency: Currency,
    network: Network,
    node: Arc<dyn TransferNode>,
}

impl Client {
    pub fn new(currency: Currency, context: &NodeContext, node: Arc<dyn TransferNode>) -> Self {
        Client {
            currency,
            network: context.network,
            node,
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    /// No daemon interaction is needed: the payer creates the transfer.
    pub async fn create_invoice(
        &self,
        amount: Amount,
        secret_hash: SecretHash,
        purpose: &str,
    ) -> Result<PayRequest, RailError> {
        let record = TransferRecord {
            network: self.network,
            asset: self.currency.clone(),
            amount,
            lock_hash: secret_hash,
            recipient: self.node.public_identifier(),
            purpose: purpose.to_owned(),
        };

        record
            .encode()
            .map_err(|e| RailError::Daemon(anyhow::Error::new(e)))
    }

    pub fn decode_invoice(&self, request: &PayRequest) -> Result<DecodedInvoice, InvoiceDecodeError> {
        let record = TransferRecord::decode(request)?;

        if record.network != self.network {
            return Err(InvoiceDecodeError(format!(
                "transfer is for {} network, we are on {}",
                record.network, self.network
            )));
        }
        if record.asset != self.currency {
            return Err(InvoiceDecodeError(format!(
                "transfer is denominated in {}, expected {}",
                record.asset, self.currency
            )));
        }

        Ok(DecodedInvoice {
            currency: record.asset,
            amount: record.amount,
            secret_hash: record.lock_hash,
            destination: record.recipient,
        })
    }

    pub async fn pay(&self, request: &PayRequest) -> Result<Secret, PaymentFailed> {
        let invoice = self
            .decode_invoice(request)
            .map_err(|e| PaymentFailed(e.to_string()))?;

        let transfer_id = self
            .node
            .create_conditional_transfer(
                &invoice.destination,
                &invoice.currency,
                invoice.amount,
                invoice.secret_hash,
            )
            .await
            .map_err(|e| PaymentFailed(format!("{:#}", e)))?;
        tracing::debug!("created conditional transfer {}", transfer_id);

        let secret = self
            .node
            .transfer_resolved(transfer_id)
            .await
            .map_err(|e| PaymentFailed(format!("transfer {}: {:#}", transfer_id, e)))?;

        verify_preimage(secret, &invoice.secret_hash)
    }

    /// Claims a conditional transfer addressed to us.
    pub async fn resolve(&self, transfer_id: TransferId, secret: Secret) -> Result<(), RailError> {
        self.node
            .resolve_transfer(transfer_id, secret)
            .await
            .map_err(RailError::Daemon)
    }

    pub async fn active_capacity(&self) -> Result<Amount, RailError> {
        self.node
            .free_balance(&self.currency)
            .await
            .map_err(RailError::Daemon)
    }

    pub async fn incoming(&self) -> Result<BoxStream<'static, IncomingPayment>, RailError> {
        let currency = self.currency.clone();
        let transfers = self
            .node
            .subscribe_transfers()
            .await
            .map_err(RailError::Daemon)?;

        Ok(transfers
            .filter(move |transfer| future::ready(transfer.asset == currency))
            .map(|transfer| IncomingPayment {
                currency: transfer.asset,
                secret_hash: transfer.lock_hash,
                amount: transfer.amount,
                settlement: Settlement::Transfer(transfer.transfer_id),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn record() -> TransferRecord {
        TransferRecord {
            network: Network::Test,
            asset: Currency::from_str("USDT").unwrap(),
            amount: Amount::from_units(1_000_000),
            lock_hash: SecretHash::from([8u8; 32]),
            recipient: "vector8Uz1BdpA9hV5uTm6QUv5jj1PsUyCH8m8ciA94voCzsxVmrBRor".to_owned(),
            purpose: "swap".to_owned(),
        }
    }

    #[test]
    fn transfer_record_round_trips_through_pay_request() {
        let record = record();

        let request = record.encode().unwrap();

        assert!(request.as_str().starts_with(PREFIX));
        assert_eq!(TransferRecord::decode(&request).unwrap(), record);
    }

    #[test]
    fn htlc_requests_are_not_transfer_records() {
        let result = TransferRecord::decode(&PayRequest::new("lnx1:dev:LTC:50"));

        assert!(result.is_err());
    }

    #[test]
    fn truncated_records_fail_to_decode() {
        let request = record().encode().unwrap();
        let truncated = PayRequest::new(&request.as_str()[..request.as_str().len() - 4]);

        assert!(TransferRecord::decode(&truncated).is_err());
    }
}
