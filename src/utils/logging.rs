//! Structured logging setup.
//!
//! The crate itself only emits `tracing` events. Applications that do not
//! install their own subscriber can call [`init_logging`] once at startup.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Installs a global fmt subscriber.
///
/// `RUST_LOG` wins over `config.log_level` when set. Returns `false` if a
/// global subscriber was already installed, which is not an error.
pub fn init_logging(config: &LoggingConfig) -> bool {
    if !config.log_to_console {
        return false;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()));

    let installed = if config.json_format {
        let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .is_ok()
    } else {
        let layer = fmt::layer().with_target(true).with_thread_ids(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()
            .is_ok()
    };

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_disabled_installs_nothing() {
        let config = LoggingConfig {
            log_to_console: false,
            ..LoggingConfig::default()
        };
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_second_install_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}
