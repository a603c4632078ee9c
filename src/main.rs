use std::path::PathBuf;

use clap::Parser;
use log::{LevelFilter, info};

use wifi_presence::config::AppConfig;
use wifi_presence::hass::HassClient;
use wifi_presence::manager::Manager;
use wifi_presence::scanner::Ubus;

#[derive(Parser, Debug)]
#[command(version, about = "Wi-Fi presence detector for Home Assistant")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "/etc/config/presence-detector.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    let mut logger = pretty_env_logger::formatted_timed_builder();
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    } else if args.debug || config.debug {
        logger.filter_level(LevelFilter::Debug);
    } else {
        logger.filter_level(LevelFilter::Info);
    }
    logger.try_init()?;

    info!(
        "Starting presence detector {} for {}",
        env!("CARGO_PKG_VERSION"),
        config.hass.url()
    );

    let reporter = HassClient::new(&config.hass)?;
    let roster = Ubus::new(config.interfaces());

    let core = Manager::new(config, reporter, roster).with_config_path(args.config);
    core.run_loop().await?;

    Ok(())
}
