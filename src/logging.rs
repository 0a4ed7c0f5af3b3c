use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging. `RUST_LOG` wins over the configured
/// level so operators can raise verbosity without touching the config.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
