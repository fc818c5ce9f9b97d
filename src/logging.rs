//! Process-wide tracing setup.
//!
//! Filters come from `RUST_LOG` (default `info`). Output is human readable
//! or one JSON object per line.

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset or invalid.
const DEFAULT_FILTER: &str = "info";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already set.
pub fn init(format: LogFormat) -> Result<(), TryInitError> {
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json.then(|| fmt::layer().json().with_current_span(false)))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .try_init()
}
