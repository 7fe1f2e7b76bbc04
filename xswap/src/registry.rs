use crate::{
    asset::Currency,
    network::{Network, NodeContext},
    order::TradingPair,
    rail::{htlc, transfer, IncomingPayment, RailClient, RailError, RailKind},
};
use futures::stream::{self, BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};

/// A shared, immutable binding between a currency and its rail client.
pub type RailClientHandle = Arc<RailClient>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no payment rail client for {0}")]
pub struct ClientUnavailable(pub Currency);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a rail client for {0} is already registered")]
pub struct AlreadyRegistered(pub Currency);

/// Maps currencies to the rail client settling them.
///
/// Built once through [`RegistryBuilder`] before any deal is started and never
/// modified afterwards.
#[derive(Debug)]
pub struct Registry {
    network: Network,
    clients: HashMap<Currency, RailClientHandle>,
}

impl Registry {
    pub fn builder(context: &NodeContext) -> RegistryBuilder {
        RegistryBuilder {
            context: context.clone(),
            clients: HashMap::new(),
        }
    }

    pub fn resolve(&self, currency: &Currency) -> Result<RailClientHandle, ClientUnavailable> {
        self.clients
            .get(currency)
            .cloned()
            .ok_or_else(|| ClientUnavailable(currency.clone()))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn currencies(&self) -> impl Iterator<Item = (&Currency, RailKind)> {
        self.clients
            .iter()
            .map(|(currency, client)| (currency, client.kind()))
    }

    pub fn supports(&self, pair: &TradingPair) -> bool {
        self.clients.contains_key(pair.base()) && self.clients.contains_key(pair.quote())
    }

    /// All incoming payments of all registered rails, merged into one stream.
    pub async fn incoming(&self) -> Result<BoxStream<'static, IncomingPayment>, RailError> {
        let mut streams = Vec::with_capacity(self.clients.len());
        for client in self.clients.values() {
            streams.push(client.incoming().await?);
        }

        Ok(stream::select_all(streams).boxed())
    }
}

#[derive(Debug)]
pub struct RegistryBuilder {
    context: NodeContext,
    clients: HashMap<Currency, RailClientHandle>,
}

impl RegistryBuilder {
    pub fn with_htlc(
        self,
        currency: Currency,
        node: Arc<dyn htlc::LightningNode>,
    ) -> Result<Self, AlreadyRegistered> {
        let client = htlc::Client::new(currency.clone(), &self.context, node);

        self.register(currency, RailClient::Htlc(client))
    }

    pub fn with_transfer(
        self,
        currency: Currency,
        node: Arc<dyn transfer::TransferNode>,
    ) -> Result<Self, AlreadyRegistered> {
        let client = transfer::Client::new(currency.clone(), &self.context, node);

        self.register(currency, RailClient::Transfer(client))
    }

    fn register(mut self, currency: Currency, client: RailClient) -> Result<Self, AlreadyRegistered> {
        if self.clients.contains_key(&currency) {
            return Err(AlreadyRegistered(currency));
        }

        tracing::info!("{} settles on the {} rail", currency, client.kind());
        self.clients.insert(currency, Arc::new(client));

        Ok(self)
    }

    pub fn build(self) -> Registry {
        Registry {
            network: self.context.network,
            clients: self.clients,
        }
    }
}
