use std::sync::Arc;

use clap::Parser;
use keysync_leader::config::{Config, ConfigArgs};
use keysync_leader::keys::EnclaveKeys;
use keysync_leader::transport::unauthenticated_client;
use keysync_leader::{LeaderSync, init_logging};

#[cfg(not(any(feature = "tdx", feature = "transparent")))]
compile_error!("Either the `tdx` or the `transparent` feature must be enabled");

#[derive(Parser)]
#[command(version, about, long_about=None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config = Config::load_or_init(cli.config)?;
    let keys = Arc::new(EnclaveKeys::load(&config.keys_file)?);
    let client = unauthenticated_client(config.request_timeout)?;
    let leader = LeaderSync::new(attester(&config)?, keys, client).with_backoff(config.backoff());

    tracing::info!("Syncing keys with {}", config.worker_url);
    leader.sync_with(&config.worker_url).await?;
    Ok(())
}

#[cfg(feature = "tdx")]
fn attester(config: &Config) -> eyre::Result<keysync_leader::tdx::TdxAttester> {
    let expected = config
        .attestation
        .tdx
        .clone()
        .ok_or_else(|| eyre::eyre!("No TDX measurements configured"))?;
    Ok(keysync_leader::tdx::TdxAttester::new(expected))
}

#[cfg(all(feature = "transparent", not(feature = "tdx")))]
fn attester(config: &Config) -> eyre::Result<keysync_leader::transparent::TransparentAttester> {
    Ok(keysync_leader::transparent::TransparentAttester::new(
        config.measurement()?,
    ))
}
