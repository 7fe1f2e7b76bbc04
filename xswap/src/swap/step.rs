//! The asynchronous operations a deal performs between two phases.
//!
//! Each step runs outside of the engine's state and reports back exactly one
//! [`Outcome`].

use crate::{
    asset::{Amount, Currency},
    fee::FeeLedger,
    network::{InvoiceExchange, InvoiceExchangeAck, Packet, PeerId, Transport},
    rail::{IncomingPayment, PayRequest},
    registry::{RailClientHandle, Registry},
    Failure, FailureReason, Secret, SecretHash,
};
use std::sync::Arc;

#[derive(Debug)]
pub enum Outcome {
    RequestSent,
    AcceptSent,
    InvoiceSent(PayRequest),
    AckSent(PayRequest),
    Paid(Secret),
    Settled(Secret),
    Failed(Failure),
}

/// Whether our invoice answers the peer's one or opens the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceLeg {
    Exchange,
    Ack,
}

/// The shared collaborators steps operate on.
#[derive(Debug, Clone)]
pub struct Steps {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<Registry>,
    pub fees: Option<Arc<dyn FeeLedger>>,
}

impl Steps {
    pub fn resolve(&self, currency: &Currency) -> Result<RailClientHandle, Failure> {
        self.registry
            .resolve(currency)
            .map_err(|e| Failure::new(FailureReason::ClientUnavailable, e.to_string()))
    }

    async fn send(&self, peer: &PeerId, packet: Packet) -> Result<(), Failure> {
        self.transport
            .send(peer, packet)
            .await
            .map_err(|e| Failure::new(FailureReason::PeerUnreachable, e.to_string()))
    }

    /// Advisory check that `amount` can be paid, leaving reserved fees untouched.
    async fn ensure_capacity(&self, currency: &Currency, amount: Amount) -> Result<(), Failure> {
        let client = self.resolve(currency)?;
        let capacity = client.active_capacity().await.map_err(|e| {
            Failure::new(
                FailureReason::ClientUnavailable,
                format!("{} capacity unknown: {}", currency, e),
            )
        })?;
        let reserved = self
            .fees
            .as_ref()
            .map(|fees| fees.current_reserved(currency))
            .unwrap_or_default();
        let available = capacity.saturating_sub(reserved);

        if available < amount {
            return Err(Failure::new(
                FailureReason::InsufficientCapacity,
                format!(
                    "{} {} needed but only {} available",
                    amount, currency, available
                ),
            ));
        }

        Ok(())
    }

    pub async fn request(
        self,
        peer: PeerId,
        packet: Packet,
        pays: Currency,
        amount: Amount,
    ) -> Result<Outcome, Failure> {
        self.ensure_capacity(&pays, amount).await?;
        self.send(&peer, packet).await?;

        Ok(Outcome::RequestSent)
    }

    pub async fn accept(
        self,
        peer: PeerId,
        packet: Packet,
        pays: Currency,
        amount: Amount,
    ) -> Result<Outcome, Failure> {
        self.ensure_capacity(&pays, amount).await?;
        self.send(&peer, packet).await?;

        Ok(Outcome::AcceptSent)
    }

    /// Creates our invoice for the currency we receive and sends it.
    pub async fn invoice(
        self,
        peer: PeerId,
        leg: InvoiceLeg,
        receives: Currency,
        amount: Amount,
        secret_hash: SecretHash,
        purpose: String,
    ) -> Result<Outcome, Failure> {
        let client = self.resolve(&receives)?;
        let pay_request = client
            .create_invoice(amount, secret_hash, &purpose)
            .await
            .map_err(|e| Failure::new(FailureReason::ClientUnavailable, e.to_string()))?;

        let packet = match leg {
            InvoiceLeg::Exchange => Packet::from(InvoiceExchange {
                secret_hash,
                pay_request: pay_request.clone(),
            }),
            InvoiceLeg::Ack => Packet::from(InvoiceExchangeAck {
                secret_hash,
                pay_request: pay_request.clone(),
            }),
        };
        if let Err(failure) = self.send(&peer, packet).await {
            Steps::cancel_invoice(client, secret_hash).await;
            return Err(failure);
        }

        Ok(match leg {
            InvoiceLeg::Exchange => Outcome::InvoiceSent(pay_request),
            InvoiceLeg::Ack => Outcome::AckSent(pay_request),
        })
    }

    pub async fn pay(client: RailClientHandle, pay_request: PayRequest) -> Result<Outcome, Failure> {
        let secret = client
            .pay(&pay_request)
            .await
            .map_err(|e| Failure::new(FailureReason::PaymentFailed, e.to_string()))?;

        Ok(Outcome::Paid(secret))
    }

    pub async fn settle(
        client: RailClientHandle,
        payment: IncomingPayment,
        secret: Secret,
    ) -> Result<Outcome, Failure> {
        client.settle(&payment, secret).await.map_err(|e| {
            Failure::new(
                FailureReason::PaymentFailed,
                format!("failed to claim incoming {}: {}", payment.currency, e),
            )
        })?;

        Ok(Outcome::Settled(secret))
    }

    /// Best effort, a failure only leaves the invoice to expire on its own.
    pub async fn cancel_invoice(client: RailClientHandle, secret_hash: SecretHash) {
        match client.cancel_invoice(secret_hash).await {
            Ok(()) => tracing::debug!("cancelled our {} invoice", client.currency()),
            Err(e) => tracing::warn!("failed to cancel our {} invoice: {}", client.currency(), e),
        }
    }
}
