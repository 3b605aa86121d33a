pub mod constants;
pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

impl SupervisorConfig {
    /// Load configuration from a JSON file with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();

        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;

        let mut cfg: SupervisorConfig =
            serde_json::from_str(&raw).context("Failed to deserialize configuration")?;

        // Override with environment variables (KEEL_)
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `KEEL_*` overrides through an injectable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", constants::ENV_PREFIX, name));
        let millis = |name: &str| -> Result<Option<Duration>> {
            match var(name) {
                Some(v) => {
                    let ms: u64 = v
                        .parse()
                        .with_context(|| format!("Invalid {}{}: '{}'", constants::ENV_PREFIX, name, v))?;
                    Ok(Some(Duration::from_millis(ms)))
                }
                None => Ok(None),
            }
        };

        if let Some(url) = var("URL") {
            self.transport.url = url;
        }
        if let Some(d) = millis("CONNECT_TIMEOUT_MS")? {
            self.transport.connect_timeout = d;
        }
        if let Some(d) = millis("HEARTBEAT_INTERVAL_MS")? {
            self.heartbeat.interval = d;
        }
        if let Some(d) = millis("HEARTBEAT_TIMEOUT_MS")? {
            self.heartbeat.timeout = d;
        }
        if let Some(d) = millis("SUSPENSION_TIMEOUT_MS")? {
            self.resilience.suspension_timeout = d;
        }
        if let Some(v) = var("MAX_ATTEMPTS") {
            self.resilience.max_attempts = v
                .parse()
                .with_context(|| format!("Invalid KEEL_MAX_ATTEMPTS: '{}'", v))?;
        }
        if let Some(v) = var("FAILURE_THRESHOLD") {
            self.resilience.failure_threshold = v
                .parse()
                .with_context(|| format!("Invalid KEEL_FAILURE_THRESHOLD: '{}'", v))?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.logging.level = level;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !(self.transport.url.starts_with("ws://") || self.transport.url.starts_with("wss://")) {
            anyhow::bail!(
                "Invalid transport url '{}', must start with ws:// or wss://",
                self.transport.url
            );
        }

        if self.transport.connect_timeout.is_zero() {
            anyhow::bail!("connect_timeout_ms must be positive");
        }

        if self.heartbeat.interval.is_zero() || self.heartbeat.timeout.is_zero() {
            anyhow::bail!("heartbeat interval_ms and timeout_ms must be positive");
        }

        let q = &self.heartbeat.quality;
        if !(0 <= q.excellent_ms && q.excellent_ms <= q.good_ms && q.good_ms <= q.fair_ms) {
            anyhow::bail!(
                "quality thresholds must be ordered: 0 <= excellent ({}) <= good ({}) <= fair ({})",
                q.excellent_ms,
                q.good_ms,
                q.fair_ms
            );
        }

        let backoff = &self.resilience.backoff;
        if backoff.initial_delay > backoff.max_delay {
            anyhow::bail!("backoff initial_delay_ms cannot exceed max_delay_ms");
        }

        if backoff.multiplier < 1.0 {
            anyhow::bail!("backoff multiplier must be >= 1.0");
        }

        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            anyhow::bail!("backoff jitter_factor must be between 0.0 and 1.0");
        }

        if self.resilience.failure_threshold == 0 {
            anyhow::bail!("failure_threshold must be positive");
        }

        if self.session.request_timeout.is_zero() {
            anyhow::bail!("session request_timeout_ms must be positive");
        }

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.logging.level,
                valid_log_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = SupervisorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.request_timeout, Duration::from_secs(15));
        assert_eq!(config.resilience.failure_threshold, constants::FAILURE_THRESHOLD);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SupervisorConfig::default();

        // Invalid URL scheme
        config.transport.url = "http://example.com".to_string();
        assert!(config.validate().is_err());
        config.transport.url = "wss://example.com/ws".to_string();
        assert!(config.validate().is_ok());

        // Unordered quality thresholds
        config.heartbeat.quality.good_ms = 50;
        assert!(config.validate().is_err());
        config.heartbeat.quality.good_ms = 500;

        // Jitter out of range
        config.resilience.backoff.jitter_factor = 1.5;
        assert!(config.validate().is_err());
        config.resilience.backoff.jitter_factor = 0.2;

        // Zero threshold
        config.resilience.failure_threshold = 0;
        assert!(config.validate().is_err());
        config.resilience.failure_threshold = 3;

        // Bad log level
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "transport": {{ "url": "wss://backend.example/ws" }},
                "heartbeat": {{ "timeout_ms": 500 }},
                "resilience": {{ "failure_threshold": 3, "backoff": {{ "jitter_factor": 0.0 }} }}
            }}"#
        )
        .unwrap();

        let config = SupervisorConfig::load(file.path()).unwrap();
        assert_eq!(config.transport.url, "wss://backend.example/ws");
        assert_eq!(config.heartbeat.timeout, Duration::from_millis(500));
        assert_eq!(
            config.heartbeat.interval,
            Duration::from_millis(constants::HEARTBEAT_INTERVAL_MS)
        );
        assert_eq!(config.resilience.failure_threshold, 3);
        assert_eq!(config.resilience.backoff.jitter_factor, 0.0);
        assert_eq!(config.resilience.max_attempts, constants::MAX_RECONNECT_ATTEMPTS);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KEEL_URL", "ws://localhost:9000/ws"),
            ("KEEL_HEARTBEAT_TIMEOUT_MS", "750"),
            ("KEEL_MAX_ATTEMPTS", "4"),
        ]
        .into_iter()
        .collect();

        let mut config = SupervisorConfig::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.transport.url, "ws://localhost:9000/ws");
        assert_eq!(config.heartbeat.timeout, Duration::from_millis(750));
        assert_eq!(config.resilience.max_attempts, 4);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = SupervisorConfig::default();
        let result = config.apply_env_overrides(|k| {
            (k == "KEEL_MAX_ATTEMPTS").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }
}
