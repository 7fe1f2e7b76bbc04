use config as config_rs;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{ffi::OsStr, path::Path};
use xswap::{network, rail::RailKind, Currency, PeerId};

/// This struct aims to represent the configuration file as it appears on disk.
///
/// Optional elements of the configuration file are represented as `Option`s
/// here, defaults are filled in when turning it into
/// [`Settings`](crate::config::Settings).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct File {
    pub logging: Option<Logging>,
    pub network: Option<Network>,
    pub swap: Option<Swap>,
    pub rails: Option<Vec<Rail>>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Logging {
    pub level: Option<Level>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Network {
    /// Public identifier peers address this node by.
    pub identity: Option<PeerId>,
    pub network: Option<network::Network>,
}

/// Timeouts in seconds.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Swap {
    pub accept_timeout_secs: Option<u64>,
    pub invoice_exchange_timeout_secs: Option<u64>,
    pub payment_timeout_secs: Option<u64>,
    pub deal_timeout_secs: Option<u64>,
}

/// Which payment rail settles a currency.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Rail {
    pub currency: Currency,
    pub kind: RailKind,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for Level {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => Level::Error, // We don't support suppressing all logs.
            LevelFilter::Error => Level::Error,
            LevelFilter::Warn => Level::Warn,
            LevelFilter::Info => Level::Info,
            LevelFilter::Debug => Level::Debug,
            LevelFilter::Trace => Level::Trace,
        }
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => LevelFilter::Error,
            Level::Warn => LevelFilter::Warn,
            Level::Info => LevelFilter::Info,
            Level::Debug => LevelFilter::Debug,
            Level::Trace => LevelFilter::Trace,
        }
    }
}

impl File {
    pub fn read<D>(config_file: D) -> Result<Self, config_rs::ConfigError>
    where
        D: AsRef<OsStr>,
    {
        let config_file = Path::new(&config_file);

        let mut config = config_rs::Config::new();
        config.merge(config_rs::File::from(config_file))?;
        config.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use std::str::FromStr;

    #[test]
    fn full_config_deserializes() {
        let contents = r#"
            [logging]
            level = "Debug"

            [network]
            identity = "alice"
            network = "test"

            [swap]
            accept_timeout_secs = 30
            deal_timeout_secs = 600

            [[rails]]
            currency = "BTC"
            kind = "htlc"

            [[rails]]
            currency = "ETH"
            kind = "transfer"
        "#;

        let file = toml::from_str::<File>(contents);

        assert_that(&file).is_ok_containing(File {
            logging: Some(Logging {
                level: Some(Level::Debug),
            }),
            network: Some(Network {
                identity: Some(PeerId::new("alice")),
                network: Some(network::Network::Test),
            }),
            swap: Some(Swap {
                accept_timeout_secs: Some(30),
                deal_timeout_secs: Some(600),
                ..Swap::default()
            }),
            rails: Some(vec![
                Rail {
                    currency: Currency::from_str("BTC").unwrap(),
                    kind: RailKind::Htlc,
                },
                Rail {
                    currency: Currency::from_str("ETH").unwrap(),
                    kind: RailKind::Transfer,
                },
            ]),
        });
    }

    #[test]
    fn unknown_sections_are_rejected() {
        let file = toml::from_str::<File>("[bitcoin]\nnetwork = \"regtest\"");

        assert_that(&file).is_err();
    }

    #[test]
    fn invalid_currency_is_rejected() {
        let contents = "[[rails]]\ncurrency = \"btc\"\nkind = \"htlc\"";

        assert_that(&toml::from_str::<File>(contents)).is_err();
    }

    #[test]
    fn level_filter_round_trips_through_level() {
        for level in &[
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            assert_eq!(LevelFilter::from(Level::from(*level)), *level);
        }
    }
}
