//! A simulated payment network for development and tests.
//!
//! One [`SimNetwork`] stands for one currency. Nodes on it hold balances and
//! lock payments to a hash lock; a locked payment moves to the payee once the
//! payee claims it with the matching preimage. [`SimLightningNode`] and
//! [`SimTransferNode`] expose such a network through the daemon interfaces of
//! the two rail kinds.

use crate::{
    asset::{Amount, Currency},
    rail::{
        htlc::{AcceptedHtlc, LightningNode},
        transfer::{PendingTransfer, TransferId, TransferNode},
    },
    Secret, SecretHash,
};
use anyhow::{anyhow, bail, Context};
use futures::{
    channel::{mpsc, oneshot},
    stream::BoxStream,
    StreamExt,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Offer {
    lock_id: TransferId,
    secret_hash: SecretHash,
    amount: Amount,
}

#[derive(Debug)]
struct Lock {
    payer: String,
    payee: String,
    secret_hash: SecretHash,
    amount: Amount,
    claimed: oneshot::Sender<Secret>,
}

#[derive(Debug, Default)]
struct State {
    balances: HashMap<String, Amount>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Offer>>>,
    invoices: HashMap<(String, SecretHash), Amount>,
    locks: HashMap<TransferId, Lock>,
    payments_attempted: usize,
}

#[derive(Debug, Clone)]
pub struct SimNetwork {
    currency: Currency,
    state: Arc<Mutex<State>>,
}

impl SimNetwork {
    pub fn new(currency: Currency) -> Self {
        SimNetwork {
            currency,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub async fn fund(&self, node: &str, amount: Amount) {
        self.state
            .lock()
            .await
            .balances
            .insert(node.to_owned(), amount);
    }

    pub async fn balance(&self, node: &str) -> Amount {
        self.state
            .lock()
            .await
            .balances
            .get(node)
            .copied()
            .unwrap_or_default()
    }

    /// How many payments were attempted on this network, successful or not.
    pub async fn payments_attempted(&self) -> usize {
        self.state.lock().await.payments_attempted
    }

    pub async fn pending_locks(&self) -> usize {
        self.state.lock().await.locks.len()
    }

    /// Hold invoices that were neither settled nor cancelled.
    pub async fn open_invoices(&self) -> usize {
        self.state.lock().await.invoices.len()
    }

    pub fn lightning_node(&self, id: &str) -> SimLightningNode {
        SimLightningNode {
            id: id.to_owned(),
            network: self.clone(),
        }
    }

    pub fn transfer_node(&self, id: &str) -> SimTransferNode {
        SimTransferNode {
            id: id.to_owned(),
            network: self.clone(),
            resolutions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn subscribe(&self, node: &str) -> mpsc::UnboundedReceiver<Offer> {
        let (sender, receiver) = mpsc::unbounded();
        self.state
            .lock()
            .await
            .subscribers
            .entry(node.to_owned())
            .or_default()
            .push(sender);

        receiver
    }

    async fn lock(
        &self,
        payer: &str,
        payee: &str,
        secret_hash: SecretHash,
        amount: Amount,
    ) -> anyhow::Result<(TransferId, oneshot::Receiver<Secret>)> {
        let mut state = self.state.lock().await;
        state.payments_attempted += 1;

        if !state.balances.contains_key(payee) {
            bail!("no route to {}", payee);
        }
        let balance = state.balances.get(payer).copied().unwrap_or_default();
        if balance < amount {
            bail!(
                "insufficient balance: {} has {} {} but needs {}",
                payer,
                balance,
                self.currency,
                amount
            );
        }
        state
            .balances
            .insert(payer.to_owned(), balance.saturating_sub(amount));

        let lock_id = TransferId::random();
        let (claimed, receiver) = oneshot::channel();
        state.locks.insert(lock_id, Lock {
            payer: payer.to_owned(),
            payee: payee.to_owned(),
            secret_hash,
            amount,
            claimed,
        });

        let offer = Offer {
            lock_id,
            secret_hash,
            amount,
        };
        if let Some(subscribers) = state.subscribers.get_mut(payee) {
            subscribers.retain(|subscriber| subscriber.unbounded_send(offer).is_ok());
        }

        Ok((lock_id, receiver))
    }

    async fn claim(&self, payee: &str, lock_id: TransferId, secret: Secret) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;

        match state.locks.get(&lock_id) {
            None => bail!("no locked payment {}", lock_id),
            Some(lock) if lock.payee != payee => bail!("payment {} is not addressed to {}", lock_id, payee),
            Some(lock) if !secret.unlocks(&lock.secret_hash) => {
                bail!("preimage does not unlock payment {}", lock_id)
            }
            Some(_) => {}
        }

        let lock = state
            .locks
            .remove(&lock_id)
            .ok_or_else(|| anyhow!("no locked payment {}", lock_id))?;
        let balance = state.balances.get(payee).copied().unwrap_or_default();
        let credited = balance
            .checked_add(lock.amount)
            .context("payee balance overflows")?;
        state.balances.insert(payee.to_owned(), credited);
        state
            .invoices
            .remove(&(payee.to_owned(), lock.secret_hash));

        tracing::debug!(
            "{} claimed {} {} from {}",
            payee,
            lock.amount,
            self.currency,
            lock.payer
        );
        let _ = lock.claimed.send(secret);

        Ok(())
    }

    /// Drops the invoice of `payee` and gives held payments back to their
    /// payers.
    async fn cancel(&self, payee: &str, secret_hash: SecretHash) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;

        if state
            .invoices
            .remove(&(payee.to_owned(), secret_hash))
            .is_none()
        {
            bail!("{} has no invoice for {}", payee, secret_hash);
        }

        let held = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.payee == payee && lock.secret_hash == secret_hash)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for lock_id in held {
            if let Some(lock) = state.locks.remove(&lock_id) {
                let balance = state.balances.get(&lock.payer).copied().unwrap_or_default();
                let refunded = balance
                    .checked_add(lock.amount)
                    .context("payer balance overflows")?;
                state.balances.insert(lock.payer.clone(), refunded);

                tracing::debug!(
                    "{} {} held for {} returned to {}",
                    lock.amount,
                    self.currency,
                    payee,
                    lock.payer
                );
            }
        }

        Ok(())
    }
}

/// A Lightning node on a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimLightningNode {
    id: String,
    network: SimNetwork,
}

#[async_trait::async_trait]
impl LightningNode for SimLightningNode {
    fn identity(&self) -> String {
        self.id.clone()
    }

    async fn add_hold_invoice(
        &self,
        secret_hash: SecretHash,
        amount: Amount,
        _memo: &str,
    ) -> anyhow::Result<()> {
        let mut state = self.network.state.lock().await;
        let key = (self.id.clone(), secret_hash);

        if state.invoices.contains_key(&key) {
            bail!("invoice for {} already exists", secret_hash);
        }
        state.invoices.insert(key, amount);

        Ok(())
    }

    async fn settle_invoice(&self, secret: Secret) -> anyhow::Result<()> {
        let secret_hash = secret.hash();
        let lock_id = {
            let state = self.network.state.lock().await;
            state
                .locks
                .iter()
                .find(|(_, lock)| lock.payee == self.id && lock.secret_hash == secret_hash)
                .map(|(id, _)| *id)
                .ok_or_else(|| anyhow!("no accepted htlc for {}", secret_hash))?
        };

        self.network.claim(&self.id, lock_id, secret).await
    }

    async fn cancel_invoice(&self, secret_hash: SecretHash) -> anyhow::Result<()> {
        self.network.cancel(&self.id, secret_hash).await
    }

    async fn send_payment(
        &self,
        destination: &str,
        secret_hash: SecretHash,
        amount: Amount,
    ) -> anyhow::Result<Secret> {
        let invoice = self
            .network
            .state
            .lock()
            .await
            .invoices
            .get(&(destination.to_owned(), secret_hash))
            .copied();

        match invoice {
            Some(expected) if expected == amount => {}
            Some(expected) => bail!("invoice expects {} but payment is {}", expected, amount),
            None => bail!("{} has no invoice for {}", destination, secret_hash),
        }

        let (_, claimed) = self
            .network
            .lock(&self.id, destination, secret_hash, amount)
            .await?;

        claimed.await.context("htlc was cancelled")
    }

    async fn channel_balance(&self) -> anyhow::Result<Amount> {
        Ok(self.network.balance(&self.id).await)
    }

    async fn subscribe_htlcs(&self) -> anyhow::Result<BoxStream<'static, AcceptedHtlc>> {
        let offers = self.network.subscribe(&self.id).await;

        Ok(offers
            .map(|offer| AcceptedHtlc {
                secret_hash: offer.secret_hash,
                amount: offer.amount,
            })
            .boxed())
    }
}

/// A state-channel node on a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimTransferNode {
    id: String,
    network: SimNetwork,
    resolutions: Arc<Mutex<HashMap<TransferId, oneshot::Receiver<Secret>>>>,
}

#[async_trait::async_trait]
impl TransferNode for SimTransferNode {
    fn public_identifier(&self) -> String {
        self.id.clone()
    }

    async fn create_conditional_transfer(
        &self,
        recipient: &str,
        asset: &Currency,
        amount: Amount,
        lock_hash: SecretHash,
    ) -> anyhow::Result<TransferId> {
        if asset != self.network.currency() {
            bail!("{} cannot be transferred on a {} network", asset, self.network.currency());
        }

        let (transfer_id, resolved) = self
            .network
            .lock(&self.id, recipient, lock_hash, amount)
            .await?;
        self.resolutions.lock().await.insert(transfer_id, resolved);

        Ok(transfer_id)
    }

    async fn resolve_transfer(&self, transfer_id: TransferId, secret: Secret) -> anyhow::Result<()> {
        self.network.claim(&self.id, transfer_id, secret).await
    }

    async fn transfer_resolved(&self, transfer_id: TransferId) -> anyhow::Result<Secret> {
        let resolved = self
            .resolutions
            .lock()
            .await
            .remove(&transfer_id)
            .ok_or_else(|| anyhow!("unknown transfer {}", transfer_id))?;

        resolved.await.context("transfer was cancelled")
    }

    async fn free_balance(&self, asset: &Currency) -> anyhow::Result<Amount> {
        if asset != self.network.currency() {
            return Ok(Amount::ZERO);
        }

        Ok(self.network.balance(&self.id).await)
    }

    async fn subscribe_transfers(&self) -> anyhow::Result<BoxStream<'static, PendingTransfer>> {
        let asset = self.network.currency().clone();
        let offers = self.network.subscribe(&self.id).await;

        Ok(offers
            .map(move |offer| PendingTransfer {
                transfer_id: offer.lock_id,
                asset: asset.clone(),
                amount: offer.amount,
                lock_hash: offer.secret_hash,
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn network() -> SimNetwork {
        SimNetwork::new(Currency::from_str("LTC").unwrap())
    }

    #[tokio::test]
    async fn hold_invoice_payment_resolves_once_settled() {
        let network = network();
        network.fund("alice", Amount::from_units(100)).await;
        network.fund("bob", Amount::ZERO).await;
        let alice = network.lightning_node("alice");
        let bob = network.lightning_node("bob");
        let secret = Secret::from([1u8; 32]);
        let mut htlcs = bob.subscribe_htlcs().await.unwrap();

        bob.add_hold_invoice(secret.hash(), Amount::from_units(40), "test")
            .await
            .unwrap();
        let payment = tokio::spawn(async move {
            alice
                .send_payment("bob", secret.hash(), Amount::from_units(40))
                .await
        });

        let accepted = htlcs.next().await.unwrap();
        assert_eq!(accepted.secret_hash, secret.hash());
        bob.settle_invoice(secret).await.unwrap();

        assert_eq!(payment.await.unwrap().unwrap(), secret);
        assert_eq!(network.balance("alice").await, Amount::from_units(60));
        assert_eq!(network.balance("bob").await, Amount::from_units(40));
    }

    #[tokio::test]
    async fn cancelled_invoice_fails_the_held_payment_back() {
        let network = network();
        network.fund("alice", Amount::from_units(100)).await;
        network.fund("bob", Amount::ZERO).await;
        let alice = network.lightning_node("alice");
        let bob = network.lightning_node("bob");
        let secret_hash = Secret::from([6u8; 32]).hash();
        let mut htlcs = bob.subscribe_htlcs().await.unwrap();

        bob.add_hold_invoice(secret_hash, Amount::from_units(40), "test")
            .await
            .unwrap();
        let payment = tokio::spawn(async move {
            alice
                .send_payment("bob", secret_hash, Amount::from_units(40))
                .await
        });
        htlcs.next().await.unwrap();
        assert_eq!(network.balance("alice").await, Amount::from_units(60));

        bob.cancel_invoice(secret_hash).await.unwrap();

        assert!(payment.await.unwrap().is_err());
        assert_eq!(network.balance("alice").await, Amount::from_units(100));
        assert_eq!(network.balance("bob").await, Amount::ZERO);
        assert_eq!(network.pending_locks().await, 0);
        assert_eq!(network.open_invoices().await, 0);
        assert!(bob.cancel_invoice(secret_hash).await.is_err());
    }

    #[tokio::test]
    async fn payment_without_invoice_fails() {
        let network = network();
        network.fund("alice", Amount::from_units(100)).await;
        network.fund("bob", Amount::ZERO).await;

        let result = network
            .lightning_node("alice")
            .send_payment("bob", SecretHash::from([1u8; 32]), Amount::from_units(1))
            .await;

        assert!(result.is_err());
        assert_eq!(network.balance("alice").await, Amount::from_units(100));
    }

    #[tokio::test]
    async fn insufficient_balance_fails_without_locking_funds() {
        let network = network();
        network.fund("alice", Amount::from_units(10)).await;
        network.fund("bob", Amount::ZERO).await;
        let secret = Secret::from([2u8; 32]);

        let result = network
            .transfer_node("alice")
            .create_conditional_transfer(
                "bob",
                &Currency::from_str("LTC").unwrap(),
                Amount::from_units(11),
                secret.hash(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(network.pending_locks().await, 0);
        assert_eq!(network.balance("alice").await, Amount::from_units(10));
    }

    #[tokio::test]
    async fn transfer_is_only_claimed_with_the_right_preimage() {
        let network = network();
        network.fund("alice", Amount::from_units(10)).await;
        network.fund("bob", Amount::ZERO).await;
        let alice = network.transfer_node("alice");
        let bob = network.transfer_node("bob");
        let secret = Secret::from([3u8; 32]);
        let mut pending = bob.subscribe_transfers().await.unwrap();

        let transfer_id = alice
            .create_conditional_transfer(
                "bob",
                &Currency::from_str("LTC").unwrap(),
                Amount::from_units(5),
                secret.hash(),
            )
            .await
            .unwrap();
        let transfer = pending.next().await.unwrap();
        assert_eq!(transfer.transfer_id, transfer_id);

        assert!(bob
            .resolve_transfer(transfer_id, Secret::from([4u8; 32]))
            .await
            .is_err());
        bob.resolve_transfer(transfer_id, secret).await.unwrap();

        assert_eq!(alice.transfer_resolved(transfer_id).await.unwrap(), secret);
        assert_eq!(network.balance("bob").await, Amount::from_units(5));
    }
}
