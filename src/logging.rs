use color_eyre::eyre::{Result, eyre};
use tracing_subscriber::EnvFilter;

/// Env var holding an `EnvFilter` directive for diagnostic output.
pub const LOG_ENV: &str = "MACKEREL_PLUGIN_LOG";

/// Diagnostics go to stderr; stdout carries only metric lines.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| eyre!("failed to set tracing subscriber: {e}"))?;
    Ok(())
}
