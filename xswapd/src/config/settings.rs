use crate::config::{file, File};
use anyhow::{bail, Result};
use log::LevelFilter;
use std::{collections::HashSet, str::FromStr, time::Duration};
use xswap::{network::Network, rail::RailKind, swap::Timeouts, Currency, NodeContext, PeerId};

const DEFAULT_IDENTITY: &str = "xswapd";

/// The effective configuration: the config file with defaults filled in.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub logging: Logging,
    pub network: NodeContext,
    pub swap: Swap,
    pub rails: Vec<Rail>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Logging {
    pub level: LevelFilter,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::Info,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Swap {
    pub timeouts: Timeouts,
}

pub type Rail = file::Rail;

impl Swap {
    fn from_file(swap: file::Swap) -> Result<Self> {
        let defaults = Timeouts::default();
        let secs = |configured: Option<u64>, default: Duration, name: &str| match configured {
            Some(0) => bail!("{} must not be zero", name),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(default),
        };

        Ok(Swap {
            timeouts: Timeouts {
                accept: secs(swap.accept_timeout_secs, defaults.accept, "accept_timeout_secs")?,
                invoice_exchange: secs(
                    swap.invoice_exchange_timeout_secs,
                    defaults.invoice_exchange,
                    "invoice_exchange_timeout_secs",
                )?,
                payment: secs(swap.payment_timeout_secs, defaults.payment, "payment_timeout_secs")?,
                deal: secs(swap.deal_timeout_secs, defaults.deal, "deal_timeout_secs")?,
            },
        })
    }
}

impl From<Swap> for file::Swap {
    fn from(swap: Swap) -> Self {
        let Timeouts {
            accept,
            invoice_exchange,
            payment,
            deal,
        } = swap.timeouts;

        file::Swap {
            accept_timeout_secs: Some(accept.as_secs()),
            invoice_exchange_timeout_secs: Some(invoice_exchange.as_secs()),
            payment_timeout_secs: Some(payment.as_secs()),
            deal_timeout_secs: Some(deal.as_secs()),
        }
    }
}

fn default_rails() -> Vec<Rail> {
    vec![
        Rail {
            currency: Currency::from_str("BTC").expect("static currency to be valid"),
            kind: RailKind::Htlc,
        },
        Rail {
            currency: Currency::from_str("ETH").expect("static currency to be valid"),
            kind: RailKind::Transfer,
        },
    ]
}

fn network_from_file(
    network: Option<file::Network>,
    cli_network: Option<Network>,
) -> Result<NodeContext> {
    let (identity, configured) = match network {
        Some(file::Network { identity, network }) => (identity, network),
        None => (None, None),
    };

    let network = match (configured, cli_network) {
        (Some(configured), Some(cli)) if configured != cli => bail!(
            "network {} given on the command line but config file says {}",
            cli,
            configured
        ),
        (Some(network), _) | (None, Some(network)) => network,
        (None, None) => Network::default(),
    };
    let identity = identity.unwrap_or_else(|| PeerId::new(DEFAULT_IDENTITY));

    Ok(NodeContext::new(identity, network))
}

fn validate_rails(rails: &[Rail]) -> Result<()> {
    let mut seen = HashSet::new();

    for rail in rails {
        if !seen.insert(&rail.currency) {
            bail!("more than one rail configured for {}", rail.currency);
        }
    }

    Ok(())
}

impl From<Settings> for File {
    fn from(settings: Settings) -> Self {
        let Settings {
            logging: Logging { level },
            network,
            swap,
            rails,
        } = settings;

        File {
            logging: Some(file::Logging {
                level: Some(level.into()),
            }),
            network: Some(file::Network {
                identity: Some(network.identity),
                network: Some(network.network),
            }),
            swap: Some(swap.into()),
            rails: Some(rails),
        }
    }
}

impl Settings {
    pub fn from_config_file_and_defaults(
        config_file: File,
        cli_network: Option<Network>,
    ) -> Result<Self> {
        let File {
            logging,
            network,
            swap,
            rails,
        } = config_file;

        let logging = match logging {
            None | Some(file::Logging { level: None }) => Logging::default(),
            Some(file::Logging { level: Some(level) }) => Logging {
                level: level.into(),
            },
        };
        let rails = rails.unwrap_or_else(default_rails);
        validate_rails(&rails)?;

        Ok(Settings {
            logging,
            network: network_from_file(network, cli_network)?,
            swap: Swap::from_file(swap.unwrap_or_default())?,
            rails,
        })
    }

    pub fn rail(&self, currency: &Currency) -> Option<RailKind> {
        self.rails
            .iter()
            .find(|rail| &rail.currency == currency)
            .map(|rail| rail.kind)
    }
}
