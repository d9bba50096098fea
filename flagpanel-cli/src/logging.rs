use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::server::config::{LogFormat, LoggingConfig};

const DEFAULT_FILTER: &str = "info,tower_http=info";

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
///
/// Logs go to stderr so command output on stdout stays clean.
pub fn init_tracing(config: &LoggingConfig, verbose: bool) {
    let fallback = match (&config.filter, verbose) {
        (_, true) => "debug".to_string(),
        (Some(filter), false) => filter.clone(),
        (None, false) => DEFAULT_FILTER.to_string(),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .boxed(),
    };

    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init();
}
