#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

mod command;
mod config;
mod fs;
mod trace;

use crate::{
    command::{dump_config, simulate, Command, Options},
    config::{read_config, Settings},
    fs::default_config_path,
};
use anyhow::{Context, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    let file = read_config(&options.config_file, default_config_path)?;
    let settings = Settings::from_config_file_and_defaults(file, options.network)
        .context("could not initialize configuration")?;

    match options.cmd {
        Command::DumpConfig => dump_config(settings)?,
        Command::Simulate(arguments) => {
            trace::init_tracing(settings.logging.level).context("initialize tracing")?;

            let deal = simulate(settings, arguments).await?;
            println!("{}", command::summarize(&deal));
        }
    }

    Ok(())
}
