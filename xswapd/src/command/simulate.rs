use crate::config::Settings;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use structopt::StructOpt;
use xswap::{
    network::Relay,
    order::{OrderTable, OwnOrder},
    rail::RailKind,
    simnet::SimNetwork,
    EngineHandle, NodeContext, OrderId, PeerId, Position, Price, Quantity, Registry, SwapDeal,
    SwapEngine, SwapProposal, TradingPair,
};

const COUNTERPARTY: &str = "simulated-counterparty";

#[derive(StructOpt, Debug, Clone)]
pub struct Simulate {
    /// Trading pair in the form BASE_QUOTE
    #[structopt(long, default_value = "ETH_BTC")]
    pub pair: TradingPair,
    /// Whether the initiating node buys or sells the base currency
    #[structopt(long, default_value = "buy")]
    pub position: Position,
    /// Quantity of the base currency
    #[structopt(long, default_value = "10")]
    pub quantity: u64,
    /// Price of one unit of base in quote units
    #[structopt(long, default_value = "5")]
    pub price: u64,
}

struct SimRail {
    kind: RailKind,
    network: SimNetwork,
}

async fn spawn_node(
    settings: &Settings,
    relay: &Relay,
    rails: &[SimRail],
    identity: &PeerId,
) -> Result<(EngineHandle, Arc<OrderTable>)> {
    let context = NodeContext::new(identity.clone(), settings.network.network);
    let id = identity.as_str();

    let mut registry = Registry::builder(&context);
    for rail in rails {
        let currency = rail.network.currency().clone();
        registry = match rail.kind {
            RailKind::Htlc => {
                registry.with_htlc(currency, Arc::new(rail.network.lightning_node(id)))?
            }
            RailKind::Transfer => {
                registry.with_transfer(currency, Arc::new(rail.network.transfer_node(id)))?
            }
        };
    }

    let (transport, inbound) = relay.connect(&context);
    let orders = Arc::new(OrderTable::default());
    let handle = SwapEngine::new(
        Arc::new(transport),
        Arc::new(registry.build()),
        orders.clone(),
    )
    .with_timeouts(settings.swap.timeouts)
    .spawn(inbound)
    .await
    .with_context(|| format!("failed to start engine of {}", identity))?;

    Ok((handle, orders))
}

/// Runs one swap between the configured node and a simulated counterparty
/// that has a matching order.
pub async fn simulate(settings: Settings, arguments: Simulate) -> Result<SwapDeal> {
    let Simulate {
        pair,
        position,
        quantity,
        price,
    } = arguments;
    let quantity = Quantity::new(quantity);
    let price = Price::new(price);

    let mut rails = Vec::new();
    for currency in &[pair.base(), pair.quote()] {
        let kind = match settings.rail(currency) {
            Some(kind) => kind,
            None => bail!("no rail configured for {}", currency),
        };
        rails.push(SimRail {
            kind,
            network: SimNetwork::new((*currency).clone()),
        });
    }

    let initiator = settings.network.identity.clone();
    let counterparty = PeerId::new(COUNTERPARTY);
    if initiator == counterparty {
        bail!("identity {} is reserved for the simulated counterparty", COUNTERPARTY);
    }

    for rail in &rails {
        let amount = pair.amount(rail.network.currency(), quantity, price)?;

        rail.network.fund(initiator.as_str(), amount).await;
        rail.network.fund(counterparty.as_str(), amount).await;
    }

    let relay = Relay::default();
    let (handle, _) = spawn_node(&settings, &relay, &rails, &initiator).await?;
    let (_counterparty_handle, orders) =
        spawn_node(&settings, &relay, &rails, &counterparty).await?;

    let order_id = OrderId::random();
    orders.insert(pair.clone(), order_id, OwnOrder {
        price,
        available: quantity,
    });

    let deal = handle
        .execute_swap(SwapProposal {
            peer: counterparty,
            pair,
            order_id,
            position,
            quantity,
            price,
        })
        .await?;

    for rail in &rails {
        tracing::info!(
            "{} balance of {} is now {}",
            rail.network.currency(),
            initiator,
            rail.network.balance(initiator.as_str()).await
        );
    }

    Ok(deal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::File;
    use std::str::FromStr;
    use xswap::{network::Network, swap::Phase};

    fn arguments(position: Position) -> Simulate {
        Simulate {
            pair: TradingPair::from_str("ETH_BTC").unwrap(),
            position,
            quantity: 10,
            price: 5,
        }
    }

    #[tokio::test]
    async fn buying_with_default_rails_completes() {
        let settings =
            Settings::from_config_file_and_defaults(File::default(), Some(Network::Dev)).unwrap();

        let deal = simulate(settings, arguments(Position::Buy)).await.unwrap();

        assert_eq!(deal.phase(), Phase::Completed);
        assert!(deal.preimage().unwrap().unlocks(&deal.secret_hash));
    }

    #[tokio::test]
    async fn selling_with_default_rails_completes() {
        let settings =
            Settings::from_config_file_and_defaults(File::default(), Some(Network::Dev)).unwrap();

        let deal = simulate(settings, arguments(Position::Sell)).await.unwrap();

        assert_eq!(deal.phase(), Phase::Completed);
    }

    #[tokio::test]
    async fn pair_without_rail_is_rejected() {
        let settings = Settings::from_config_file_and_defaults(File::default(), None).unwrap();
        let arguments = Simulate {
            pair: TradingPair::from_str("LTC_BTC").unwrap(),
            ..arguments(Position::Buy)
        };

        assert!(simulate(settings, arguments).await.is_err());
    }
}
