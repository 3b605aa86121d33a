use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing logger
///
/// `RUST_LOG` wins over `log_level` when set. Calling this twice is harmless;
/// the second subscriber is simply not installed.
pub fn init_logger(log_level: &str, json_logs: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let installed = if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already set, keeping it");
    }
}

/// Initialize from the `logging` section of the supervisor config
pub fn init_from_config(config: &LoggingConfig) {
    init_logger(&config.level, config.json);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_init_does_not_panic() {
        init_logger("debug", false);
        init_from_config(&LoggingConfig::default());
    }
}
