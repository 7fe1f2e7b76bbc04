//! Book-keeping for fees that were paid but may be refunded later.
//!
//! When a reserved fee becomes refundable is decided by a [`RefundPolicy`];
//! the ledger itself has no opinion about it.

use crate::asset::{Amount, Currency};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug},
    sync::{Arc, Mutex},
};

/// Ties a reservation to whatever it was made for, usually an order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        CorrelationId(id.into())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
pub enum FeeState {
    Reserved,
    Released,
    Burned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedFee {
    pub correlation_id: CorrelationId,
    pub currency: Currency,
    pub amount: Amount,
    pub reserved_at: DateTime<Utc>,
    pub state: FeeState,
}

/// Reserved fees of one currency split by whether they can be refunded yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundableAmount {
    pub pending: Amount,
    pub available: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeeError {
    #[error("a fee is already reserved for {0}")]
    AlreadyReserved(CorrelationId),
    #[error("no reserved fee for {0}")]
    UnknownCorrelation(CorrelationId),
    #[error("fee for {0} is not refundable yet")]
    NotRefundable(CorrelationId),
}

/// Decides whether a reserved fee may be refunded at a given time.
pub trait RefundPolicy: Debug + Send + Sync + 'static {
    fn is_refundable(&self, fee: &ReservedFee, now: DateTime<Utc>) -> bool;
}

/// Fees become refundable once they were reserved for a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct LockInterval(pub Duration);

impl RefundPolicy for LockInterval {
    fn is_refundable(&self, fee: &ReservedFee, now: DateTime<Utc>) -> bool {
        fee.reserved_at
            .checked_add_signed(self.0)
            .map_or(false, |refundable_at| now >= refundable_at)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NeverRefundable;

impl RefundPolicy for NeverRefundable {
    fn is_refundable(&self, _: &ReservedFee, _: DateTime<Utc>) -> bool {
        false
    }
}

pub trait FeeLedger: Debug + Send + Sync + 'static {
    fn reserve(
        &self,
        currency: Currency,
        amount: Amount,
        correlation_id: CorrelationId,
    ) -> Result<(), FeeError>;

    /// Gives a reservation back, regardless of the refund policy.
    fn release(&self, correlation_id: &CorrelationId) -> Result<ReservedFee, FeeError>;

    fn current_reserved(&self, currency: &Currency) -> Amount;

    fn fee(&self, correlation_id: &CorrelationId) -> Option<ReservedFee>;

    fn refundable(&self, currency: &Currency, now: DateTime<Utc>) -> RefundableAmount;

    /// Releases a reservation if the refund policy allows it at `now`.
    fn refund(
        &self,
        correlation_id: &CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<ReservedFee, FeeError>;

    /// Marks reservations as consumed, returning the total burned.
    fn burn(&self, correlation_ids: &[CorrelationId]) -> Result<Amount, FeeError>;
}

#[derive(Debug, Clone)]
pub struct InMemoryFeeLedger {
    policy: Arc<dyn RefundPolicy>,
    fees: Arc<Mutex<HashMap<CorrelationId, ReservedFee>>>,
}

impl InMemoryFeeLedger {
    pub fn new(policy: impl RefundPolicy) -> Self {
        InMemoryFeeLedger {
            policy: Arc::new(policy),
            fees: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn fees(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, ReservedFee>> {
        self.fees
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_reserved<'a>(
        fees: &'a mut HashMap<CorrelationId, ReservedFee>,
        correlation_id: &CorrelationId,
    ) -> Result<&'a mut ReservedFee, FeeError> {
        match fees.get_mut(correlation_id) {
            Some(fee) if fee.state == FeeState::Reserved => Ok(fee),
            _ => Err(FeeError::UnknownCorrelation(correlation_id.clone())),
        }
    }
}

impl FeeLedger for InMemoryFeeLedger {
    fn reserve(
        &self,
        currency: Currency,
        amount: Amount,
        correlation_id: CorrelationId,
    ) -> Result<(), FeeError> {
        let mut fees = self.fees();

        if fees.contains_key(&correlation_id) {
            return Err(FeeError::AlreadyReserved(correlation_id));
        }

        tracing::debug!("reserved {} {} for {}", amount, currency, correlation_id);
        fees.insert(correlation_id.clone(), ReservedFee {
            correlation_id,
            currency,
            amount,
            reserved_at: Utc::now(),
            state: FeeState::Reserved,
        });

        Ok(())
    }

    fn release(&self, correlation_id: &CorrelationId) -> Result<ReservedFee, FeeError> {
        let mut fees = self.fees();
        let fee = Self::take_reserved(&mut fees, correlation_id)?;
        fee.state = FeeState::Released;

        Ok(fee.clone())
    }

    fn current_reserved(&self, currency: &Currency) -> Amount {
        self.fees()
            .values()
            .filter(|fee| fee.state == FeeState::Reserved && &fee.currency == currency)
            .map(|fee| fee.amount)
            .sum()
    }

    fn fee(&self, correlation_id: &CorrelationId) -> Option<ReservedFee> {
        self.fees().get(correlation_id).cloned()
    }

    fn refundable(&self, currency: &Currency, now: DateTime<Utc>) -> RefundableAmount {
        let fees = self.fees();
        let (available, pending): (Vec<_>, Vec<_>) = fees
            .values()
            .filter(|fee| fee.state == FeeState::Reserved && &fee.currency == currency)
            .partition(|fee| self.policy.is_refundable(fee, now));

        RefundableAmount {
            pending: pending.into_iter().map(|fee| fee.amount).sum(),
            available: available.into_iter().map(|fee| fee.amount).sum(),
        }
    }

    fn refund(
        &self,
        correlation_id: &CorrelationId,
        now: DateTime<Utc>,
    ) -> Result<ReservedFee, FeeError> {
        let mut fees = self.fees();
        let fee = Self::take_reserved(&mut fees, correlation_id)?;

        if !self.policy.is_refundable(fee, now) {
            return Err(FeeError::NotRefundable(correlation_id.clone()));
        }
        fee.state = FeeState::Released;

        Ok(fee.clone())
    }

    fn burn(&self, correlation_ids: &[CorrelationId]) -> Result<Amount, FeeError> {
        let mut fees = self.fees();
        let correlation_ids = correlation_ids.iter().collect::<HashSet<_>>();

        for correlation_id in &correlation_ids {
            Self::take_reserved(&mut fees, correlation_id)?;
        }

        let mut burned = Vec::with_capacity(correlation_ids.len());
        for correlation_id in correlation_ids {
            let fee = Self::take_reserved(&mut fees, correlation_id)?;
            fee.state = FeeState::Burned;
            burned.push(fee.amount);
        }

        Ok(burned.into_iter().sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use std::str::FromStr;

    fn ltc() -> Currency {
        Currency::from_str("LTC").unwrap()
    }

    fn id(id: &str) -> CorrelationId {
        CorrelationId::new(id)
    }

    #[test]
    fn reservations_count_until_released() {
        let ledger = InMemoryFeeLedger::new(NeverRefundable);

        ledger.reserve(ltc(), Amount::from_units(10), id("a")).unwrap();
        ledger.reserve(ltc(), Amount::from_units(5), id("b")).unwrap();
        assert_eq!(ledger.current_reserved(&ltc()), Amount::from_units(15));

        let released = ledger.release(&id("a")).unwrap();

        assert_eq!(released.state, FeeState::Released);
        assert_eq!(ledger.current_reserved(&ltc()), Amount::from_units(5));
        assert_that(&ledger.release(&id("a"))).is_err_containing(FeeError::UnknownCorrelation(id("a")));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let ledger = InMemoryFeeLedger::new(NeverRefundable);

        ledger.reserve(ltc(), Amount::from_units(1), id("a")).unwrap();
        let result = ledger.reserve(ltc(), Amount::from_units(1), id("a"));

        assert_that(&result).is_err_containing(FeeError::AlreadyReserved(id("a")));
    }

    #[test]
    fn lock_interval_policy_splits_pending_and_available() {
        let ledger = InMemoryFeeLedger::new(LockInterval(Duration::hours(24)));
        ledger.reserve(ltc(), Amount::from_units(7), id("a")).unwrap();
        let now = Utc::now();

        assert_eq!(ledger.refundable(&ltc(), now), RefundableAmount {
            pending: Amount::from_units(7),
            available: Amount::ZERO,
        });
        assert_eq!(
            ledger.refundable(&ltc(), now + Duration::hours(25)),
            RefundableAmount {
                pending: Amount::ZERO,
                available: Amount::from_units(7),
            }
        );
    }

    #[test]
    fn lock_interval_beyond_the_calendar_never_elapses() {
        let ledger = InMemoryFeeLedger::new(LockInterval(Duration::max_value()));
        ledger.reserve(ltc(), Amount::from_units(2), id("a")).unwrap();

        let refundable = ledger.refundable(&ltc(), Utc::now() + Duration::days(365));

        assert_eq!(refundable.available, Amount::ZERO);
        assert_eq!(refundable.pending, Amount::from_units(2));
    }

    #[test]
    fn refund_respects_the_policy() {
        let ledger = InMemoryFeeLedger::new(LockInterval(Duration::hours(24)));
        ledger.reserve(ltc(), Amount::from_units(7), id("a")).unwrap();
        let now = Utc::now();

        assert_that(&ledger.refund(&id("a"), now)).is_err_containing(FeeError::NotRefundable(id("a")));
        assert!(ledger.refund(&id("a"), now + Duration::days(2)).is_ok());
        assert_eq!(ledger.current_reserved(&ltc()), Amount::ZERO);
    }

    #[test]
    fn burn_is_all_or_nothing() {
        let ledger = InMemoryFeeLedger::new(NeverRefundable);
        ledger.reserve(ltc(), Amount::from_units(3), id("a")).unwrap();
        ledger.reserve(ltc(), Amount::from_units(4), id("b")).unwrap();

        assert!(ledger.burn(&[id("a"), id("c")]).is_err());
        assert_eq!(ledger.current_reserved(&ltc()), Amount::from_units(7));

        assert_eq!(ledger.burn(&[id("a"), id("b")]).unwrap(), Amount::from_units(7));
        assert_eq!(ledger.fee(&id("a")).unwrap().state, FeeState::Burned);
        assert_eq!(ledger.current_reserved(&ltc()), Amount::ZERO);
    }
}
