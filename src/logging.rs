//! Tracing subscriber setup for the binary.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Pick the filter directive: `RUST_LOG` wins, then CLI flags, then config.
fn filter_directive(config: &LoggingConfig, quiet: bool, verbosity: u8) -> String {
    if quiet {
        return "warn".to_string();
    }
    match verbosity {
        0 => config.level.clone(),
        1 => "medvoice=debug,info".to_string(),
        _ => "trace".to_string(),
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays usable for
/// command output. Calling this twice is harmless; the second call is ignored.
pub fn init(config: &LoggingConfig, quiet: bool, verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(config, quiet, verbosity)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {}", e);
    }
}
