use std::path::PathBuf;
use structopt::StructOpt;

mod simulate;

use crate::config::{File, Settings};
use xswap::{network::Network, SwapDeal};

pub use simulate::{simulate, Simulate};

#[derive(StructOpt, Debug)]
pub struct Options {
    /// Path to configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config_file: Option<PathBuf>,

    /// Which network to run against
    #[structopt(short = "n", long = "network")]
    pub network: Option<Network>,

    /// Commands available
    #[structopt(subcommand)]
    pub cmd: Command,
}

impl Options {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }
}

#[derive(StructOpt, Debug, Clone)]
pub enum Command {
    /// Dump the current configuration
    DumpConfig,
    /// Run one swap between two in-process nodes on simulated payment networks
    Simulate(Simulate),
}

pub fn dump_config(settings: Settings) -> anyhow::Result<()> {
    let file = File::from(settings);
    let serialized = toml::to_string(&file)?;
    println!("{}", serialized);
    Ok(())
}

pub fn summarize(deal: &SwapDeal) -> String {
    let preimage = deal
        .preimage()
        .map(|preimage| format!("{:x}", preimage))
        .unwrap_or_else(|| "unknown".to_owned());

    format!(
        "swap {} {}: {} {} at {}, preimage {}",
        deal.secret_hash,
        deal.phase(),
        deal.quantity,
        deal.pair,
        deal.price,
        preimage
    )
}
