use anyhow::Result;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

static SUBSCRIBER_GUARD: OnceLock<()> = OnceLock::new();

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "campus_core=info,campus=info";

/// Install the global tracing subscriber.
///
/// Safe to call repeatedly: tests, the CLI and xtask all call it on startup.
pub fn init_tracing(filter: EnvFilter) -> Result<()> {
    if SUBSCRIBER_GUARD.get().is_some() {
        return Ok(());
    }

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber)?;
    SUBSCRIBER_GUARD.set(()).ok();

    Ok(())
}

/// `RUST_LOG` if set, otherwise [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
