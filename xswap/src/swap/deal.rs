use crate::{
    asset::{Amount, Currency},
    network::PeerId,
    order::{AmountError, OrderId, Price, Quantity, TradingPair},
    rail::PayRequest,
    Failure, Secret, SecretHash,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

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
pub enum Role {
    /// Generates the secret and sends the `SwapRequest`.
    Initiator,
    Counterparty,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
pub enum Phase {
    Created,
    AwaitingAccept,
    Accepted,
    AwaitingCounterInvoice,
    InvoiceValidated,
    LegOnePaid,
    LegTwoPaid,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// The phase a deal of `role` moves to after this one on success.
    ///
    /// The initiator never pays first, hence it has no `LegOnePaid` phase. The
    /// counterparty never waits for a `SwapAccepted`.
    pub fn successor(self, role: Role) -> Option<Phase> {
        use Phase::*;

        let next = match (role, self) {
            (Role::Initiator, Created) => AwaitingAccept,
            (Role::Initiator, AwaitingAccept) => Accepted,
            (Role::Counterparty, Created) => Accepted,
            (_, Accepted) => AwaitingCounterInvoice,
            (_, AwaitingCounterInvoice) => InvoiceValidated,
            (Role::Initiator, InvoiceValidated) => LegTwoPaid,
            (Role::Counterparty, InvoiceValidated) => LegOnePaid,
            (Role::Counterparty, LegOnePaid) => LegTwoPaid,
            (_, LegTwoPaid) => Completed,
            (Role::Counterparty, AwaitingAccept) | (Role::Initiator, LegOnePaid) => return None,
            (_, Completed) | (_, Failed) => return None,
        };

        Some(next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{role} deal cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub role: Role,
    pub from: Phase,
    pub to: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PreimageError {
    #[error("preimage does not hash to the deal's hash lock")]
    HashMismatch,
    #[error("a different preimage was already recorded")]
    AlreadySet,
}

/// One attempt at an atomic swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapDeal {
    pub secret_hash: SecretHash,
    pub role: Role,
    pub peer: PeerId,
    pub pair: TradingPair,
    pub order_id: OrderId,
    pub proposed_quantity: Quantity,
    pub quantity: Quantity,
    pub price: Price,
    /// The currency the initiator receives.
    pub initiator_currency: Currency,
    /// The currency the counterparty receives.
    pub counterparty_currency: Currency,
    pub initiator_pay_request: Option<PayRequest>,
    pub counterparty_pay_request: Option<PayRequest>,
    preimage: Option<Secret>,
    phase: Phase,
    failure: Option<Failure>,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
}

/// The economic terms a deal is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terms {
    pub pair: TradingPair,
    pub order_id: OrderId,
    pub quantity: Quantity,
    pub price: Price,
    pub initiator_currency: Currency,
    pub counterparty_currency: Currency,
}

impl SwapDeal {
    pub fn new(
        secret_hash: SecretHash,
        role: Role,
        peer: PeerId,
        terms: Terms,
        created_at: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        SwapDeal {
            secret_hash,
            role,
            peer,
            pair: terms.pair,
            order_id: terms.order_id,
            proposed_quantity: terms.quantity,
            quantity: terms.quantity,
            price: terms.price,
            initiator_currency: terms.initiator_currency,
            counterparty_currency: terms.counterparty_currency,
            initiator_pay_request: None,
            counterparty_pay_request: None,
            preimage: None,
            phase: Phase::Created,
            failure: None,
            created_at,
            deadline_at,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn preimage(&self) -> Option<Secret> {
        self.preimage
    }

    /// Populated only once the deal failed.
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// The currency this side receives.
    pub fn inbound_currency(&self) -> &Currency {
        match self.role {
            Role::Initiator => &self.initiator_currency,
            Role::Counterparty => &self.counterparty_currency,
        }
    }

    /// The currency this side pays.
    pub fn outbound_currency(&self) -> &Currency {
        match self.role {
            Role::Initiator => &self.counterparty_currency,
            Role::Counterparty => &self.initiator_currency,
        }
    }

    /// The payment request this side created for the currency it receives.
    pub fn own_pay_request(&self) -> Option<&PayRequest> {
        match self.role {
            Role::Initiator => self.initiator_pay_request.as_ref(),
            Role::Counterparty => self.counterparty_pay_request.as_ref(),
        }
    }

    /// The amount of `currency` that the agreed terms move.
    pub fn amount(&self, currency: &Currency) -> Result<Amount, AmountError> {
        self.pair.amount(currency, self.quantity, self.price)
    }

    /// Moves the deal to the next phase of its role.
    pub fn advance_to(&mut self, next: Phase) -> Result<(), InvalidTransition> {
        if next == Phase::Failed || self.phase.successor(self.role) != Some(next) {
            return Err(InvalidTransition {
                role: self.role,
                from: self.phase,
                to: next,
            });
        }

        self.phase = next;

        Ok(())
    }

    pub fn fail(&mut self, failure: Failure) -> Result<(), InvalidTransition> {
        if self.phase.is_terminal() {
            return Err(InvalidTransition {
                role: self.role,
                from: self.phase,
                to: Phase::Failed,
            });
        }

        self.phase = Phase::Failed;
        self.failure = Some(failure);

        Ok(())
    }

    /// Records the secret observed on one of the legs.
    pub fn record_preimage(&mut self, secret: Secret) -> Result<(), PreimageError> {
        if !secret.unlocks(&self.secret_hash) {
            return Err(PreimageError::HashMismatch);
        }

        match self.preimage {
            Some(known) if known != secret => Err(PreimageError::AlreadySet),
            _ => {
                self.preimage = Some(secret);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureReason;
    use chrono::Duration;
    use quickcheck::{quickcheck, Arbitrary, Gen};
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    fn deal(role: Role, secret: Secret) -> SwapDeal {
        let now = Utc::now();

        SwapDeal::new(
            secret.hash(),
            role,
            PeerId::new("peer"),
            Terms {
                pair: TradingPair::from_str("A_B").unwrap(),
                order_id: OrderId::random(),
                quantity: Quantity::new(10),
                price: Price::new(5),
                initiator_currency: Currency::from_str("B").unwrap(),
                counterparty_currency: Currency::from_str("A").unwrap(),
            },
            now,
            now + Duration::minutes(5),
        )
    }

    fn happy_path(role: Role) -> Vec<Phase> {
        let mut phases = vec![Phase::Created];
        while let Some(next) = phases.last().and_then(|phase| phase.successor(role)) {
            phases.push(next);
        }

        phases
    }

    impl Arbitrary for Role {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            if bool::arbitrary(g) {
                Role::Initiator
            } else {
                Role::Counterparty
            }
        }
    }

    impl Arbitrary for Phase {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let phases = Phase::iter().collect::<Vec<_>>();

            phases[g.next_u32() as usize % phases.len()]
        }
    }

    #[test]
    fn initiator_skips_leg_one_paid() {
        assert_eq!(happy_path(Role::Initiator), vec![
            Phase::Created,
            Phase::AwaitingAccept,
            Phase::Accepted,
            Phase::AwaitingCounterInvoice,
            Phase::InvoiceValidated,
            Phase::LegTwoPaid,
            Phase::Completed,
        ]);
    }

    #[test]
    fn counterparty_skips_awaiting_accept() {
        assert_eq!(happy_path(Role::Counterparty), vec![
            Phase::Created,
            Phase::Accepted,
            Phase::AwaitingCounterInvoice,
            Phase::InvoiceValidated,
            Phase::LegOnePaid,
            Phase::LegTwoPaid,
            Phase::Completed,
        ]);
    }

    #[test]
    fn deal_amounts_follow_the_pair() {
        let deal = deal(Role::Initiator, Secret::from([1u8; 32]));

        assert_eq!(deal.amount(deal.inbound_currency()), Ok(Amount::from_units(50)));
        assert_eq!(deal.amount(deal.outbound_currency()), Ok(Amount::from_units(10)));
    }

    #[test]
    fn failure_is_recorded_only_on_failed_deals() {
        let mut deal = deal(Role::Counterparty, Secret::from([1u8; 32]));
        assert_eq!(deal.failure(), None);

        deal.fail(Failure::from(FailureReason::Timeout)).unwrap();

        assert_eq!(deal.phase(), Phase::Failed);
        assert_eq!(deal.failure().unwrap().reason, FailureReason::Timeout);
        assert!(deal.fail(Failure::from(FailureReason::Rejected)).is_err());
    }

    #[test]
    fn preimage_must_match_and_is_immutable() {
        let secret = Secret::from([1u8; 32]);
        let mut deal = deal(Role::Initiator, secret);

        assert_eq!(
            deal.record_preimage(Secret::from([2u8; 32])),
            Err(PreimageError::HashMismatch)
        );
        assert_eq!(deal.preimage(), None);

        deal.record_preimage(secret).unwrap();
        deal.record_preimage(secret).unwrap();

        assert_eq!(deal.preimage(), Some(secret));
    }

    quickcheck! {
        fn phases_never_move_backwards(role: Role, targets: Vec<Phase>) -> bool {
            let mut deal = deal(role, Secret::from([1u8; 32]));
            let mut visited = vec![deal.phase()];

            for target in targets {
                let before = deal.phase();
                let result = if target == Phase::Failed {
                    deal.fail(Failure::from(FailureReason::Timeout))
                } else {
                    deal.advance_to(target)
                };

                match result {
                    Ok(()) => {
                        if deal.phase() <= before || visited.contains(&deal.phase()) {
                            return false;
                        }
                        visited.push(deal.phase());
                    }
                    Err(_) => {
                        if deal.phase() != before {
                            return false;
                        }
                    }
                }
            }

            true
        }

        fn failed_is_reachable_from_every_non_terminal_phase(role: Role, steps: u8) -> bool {
            let mut deal = deal(role, Secret::from([1u8; 32]));

            for _ in 0..(steps % 7) {
                if let Some(next) = deal.phase().successor(role) {
                    if !next.is_terminal() {
                        deal.advance_to(next).unwrap();
                    }
                }
            }

            !deal.is_terminal() && deal.fail(Failure::from(FailureReason::Timeout)).is_ok()
        }
    }
}
