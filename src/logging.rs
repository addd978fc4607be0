//! Tracing initialisation.
//!
//! `RUST_LOG` takes precedence; otherwise the configured `log_level` applies to
//! the whole process.
//!
//! ```bash
//! RUST_LOG=ssr_daq::sequencer=debug ssr_daq cycle --count 3
//! ```

use crate::config::{ApplicationConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(config: &ApplicationConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    if result.is_ok() {
        tracing::debug!(
            level = %config.log_level,
            format = ?config.log_format,
            "Tracing initialized"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = ApplicationConfig::default();
        init(&config);
        init(&config);
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let config = ApplicationConfig {
            log_level: "not a level ===".to_string(),
            ..ApplicationConfig::default()
        };
        init(&config);
    }
}
