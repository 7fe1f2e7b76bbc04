use crate::{swap::SwapDeal, SecretHash};
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex},
};

/// Where the engine keeps deals once they completed or failed.
///
/// The engine loads every hash lock known to the repository when it starts, so
/// none of them can be used for a new deal.
pub trait SwapRepository: Debug + Send + Sync + 'static {
    /// Inserts the deal or replaces the one with the same hash lock.
    fn save(&self, deal: &SwapDeal) -> anyhow::Result<()>;

    fn load(&self, secret_hash: &SecretHash) -> anyhow::Result<Option<SwapDeal>>;

    fn load_all(&self) -> anyhow::Result<Vec<SwapDeal>>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySwapRepository {
    deals: Arc<Mutex<HashMap<SecretHash, SwapDeal>>>,
}

impl InMemorySwapRepository {
    fn deals(&self) -> std::sync::MutexGuard<'_, HashMap<SecretHash, SwapDeal>> {
        self.deals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SwapRepository for InMemorySwapRepository {
    fn save(&self, deal: &SwapDeal) -> anyhow::Result<()> {
        self.deals().insert(deal.secret_hash, deal.clone());

        Ok(())
    }

    fn load(&self, secret_hash: &SecretHash) -> anyhow::Result<Option<SwapDeal>> {
        Ok(self.deals().get(secret_hash).cloned())
    }

    fn load_all(&self) -> anyhow::Result<Vec<SwapDeal>> {
        Ok(self.deals().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        network::PeerId,
        order::{OrderId, Price, Quantity, TradingPair},
        swap::{Role, Terms},
        Failure, FailureReason, Secret,
    };
    use chrono::Utc;
    use std::str::FromStr;

    fn deal(secret_hash: SecretHash) -> SwapDeal {
        let pair = TradingPair::from_str("LTC_BTC").unwrap();
        let terms = Terms {
            initiator_currency: pair.base().clone(),
            counterparty_currency: pair.quote().clone(),
            pair,
            order_id: OrderId::random(),
            quantity: Quantity::new(3),
            price: Price::new(2),
        };

        SwapDeal::new(
            secret_hash,
            Role::Initiator,
            PeerId::new("bob"),
            terms,
            Utc::now(),
            Utc::now(),
        )
    }

    #[test]
    fn saving_a_deal_again_replaces_it() {
        let repository = InMemorySwapRepository::default();
        let secret_hash = Secret::generate().hash();
        let mut deal = deal(secret_hash);
        repository.save(&deal).unwrap();

        deal.fail(Failure::new(FailureReason::Timeout, "too slow"))
            .unwrap();
        repository.save(&deal).unwrap();

        assert_eq!(repository.load_all().unwrap().len(), 1);
        assert_eq!(repository.load(&secret_hash).unwrap(), Some(deal));
    }

    #[test]
    fn unknown_hash_locks_load_nothing() {
        let repository = InMemorySwapRepository::default();
        repository.save(&deal(Secret::generate().hash())).unwrap();

        let loaded = repository.load(&Secret::generate().hash()).unwrap();

        assert_eq!(loaded, None);
    }
}
