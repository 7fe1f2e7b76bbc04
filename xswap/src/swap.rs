//! The swap deal state machine.
//!
//! A single [`engine`] task owns every deal of the node. Deals advance only in
//! reaction to packets from their peer, to incoming payments on the rails, to
//! the completion of the one asynchronous step they may have outstanding, or
//! to their deadline passing.

pub mod deal;
pub mod engine;
pub mod repository;
mod step;

pub use self::{
    deal::{InvalidTransition, Phase, PreimageError, Role, SwapDeal, Terms},
    engine::{EngineHandle, SpawnError, SwapEngine},
    repository::{InMemorySwapRepository, SwapRepository},
};

use crate::{
    network::PeerId,
    order::{OrderId, Position, Price, Quantity, TradingPair},
    Failure, Secret, SecretHash,
};
use std::time::Duration;

/// How long a deal may stay in a phase before it fails with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for the counterparty to accept the request.
    pub accept: Duration,
    /// Negotiating and exchanging invoices.
    pub invoice_exchange: Duration,
    /// Waiting for payments to be claimed.
    pub payment: Duration,
    /// Upper bound on the lifetime of a whole deal.
    pub deal: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            accept: Duration::from_secs(100),
            invoice_exchange: Duration::from_secs(100),
            payment: Duration::from_secs(100),
            deal: Duration::from_secs(300),
        }
    }
}

impl Timeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        match phase {
            Phase::AwaitingAccept => self.accept,
            Phase::Created
            | Phase::Accepted
            | Phase::AwaitingCounterInvoice
            | Phase::InvoiceValidated => self.invoice_exchange,
            Phase::LegOnePaid | Phase::LegTwoPaid => self.payment,
            Phase::Completed | Phase::Failed => self.deal,
        }
    }
}

/// What the order book hands to the engine when one of its orders got
/// matched with the order of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapProposal {
    pub peer: PeerId,
    pub pair: TradingPair,
    pub order_id: OrderId,
    /// Whether we buy or sell the base currency.
    pub position: Position,
    pub quantity: Quantity,
    pub price: Price,
}

/// Lifecycle notifications for order book and UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DealEvent {
    Created {
        secret_hash: SecretHash,
        role: Role,
        peer: PeerId,
    },
    PhaseChanged {
        secret_hash: SecretHash,
        phase: Phase,
    },
    Completed {
        secret_hash: SecretHash,
        preimage: Secret,
    },
    Failed {
        secret_hash: SecretHash,
        failure: Failure,
    },
    /// Something happened to a deal after it failed that needs an operator's
    /// attention, e.g. one of its payments succeeded.
    Anomaly {
        secret_hash: SecretHash,
        message: String,
    },
}

impl DealEvent {
    pub fn secret_hash(&self) -> SecretHash {
        match self {
            DealEvent::Created { secret_hash, .. }
            | DealEvent::PhaseChanged { secret_hash, .. }
            | DealEvent::Completed { secret_hash, .. }
            | DealEvent::Failed { secret_hash, .. }
            | DealEvent::Anomaly { secret_hash, .. } => *secret_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapError {
    #[error(transparent)]
    Failed(#[from] Failure),
    #[error("hash lock {0} is already in use")]
    DuplicateRequest(SecretHash),
    #[error("swap engine is not running")]
    EngineStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_deadlines_use_the_matching_timeout() {
        let timeouts = Timeouts {
            accept: Duration::from_secs(1),
            invoice_exchange: Duration::from_secs(2),
            payment: Duration::from_secs(3),
            deal: Duration::from_secs(10),
        };

        assert_eq!(timeouts.for_phase(Phase::AwaitingAccept), Duration::from_secs(1));
        assert_eq!(timeouts.for_phase(Phase::InvoiceValidated), Duration::from_secs(2));
        assert_eq!(timeouts.for_phase(Phase::LegOnePaid), Duration::from_secs(3));
    }
}
