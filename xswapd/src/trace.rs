use log::LevelFilter;
use tracing::{info, subscriber, Level};
use tracing_subscriber::FmtSubscriber;

pub fn init_tracing(level: LevelFilter) -> anyhow::Result<()> {
    let level = match level {
        LevelFilter::Off => return Ok(()),
        LevelFilter::Error => Level::ERROR,
        LevelFilter::Warn => Level::WARN,
        LevelFilter::Info => Level::INFO,
        LevelFilter::Debug => Level::DEBUG,
        LevelFilter::Trace => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();

    subscriber::set_global_default(subscriber)?;
    info!("Initialized tracing with level: {}", level);

    Ok(())
}
