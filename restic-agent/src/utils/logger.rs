//! Logging setup using tracing.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// Initialize the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(level: &str, log: &LogConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = match log.format.as_str() {
        "compact" => fmt::layer().compact().with_target(false).boxed(),
        _ => fmt::layer().with_target(log.target).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;

    Ok(())
}
