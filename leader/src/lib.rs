use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

pub mod config;
pub mod error;
pub mod keys;
pub mod observer;
pub mod sync;
#[cfg(feature = "tdx")]
pub mod tdx;
#[cfg(feature = "transparent")]
pub mod transparent;
pub mod transport;

pub use sync::{LeaderSync, SyncState};

/// Install the global `tracing` subscriber. Records emitted through the
/// `log` facade by dependencies are forwarded to it. The filter is read
/// from `RUST_LOG` and defaults to `info`.
pub fn init_logging() -> eyre::Result<()> {
    tracing_log::LogTracer::init()?;
    let subscriber = SubscriberBuilder::default()
        .with_ansi(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
