//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::{Context, Result};
use clap::Parser;
use keel_core::orchestrator::SupervisorStats;
use keel_core::{ConnectionSnapshot, SupervisorConfig};
use std::path::PathBuf;

/// Common CLI arguments for all binaries
#[derive(Parser, Debug)]
pub struct CommonArgs {
    /// WebSocket endpoint (overrides config and KEEL_URL)
    #[arg(short, long)]
    pub url: Option<String>,

    /// JSON config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Access token (falls back to KEEL_TOKEN)
    #[arg(short, long)]
    pub token: Option<String>,

    /// Device id to present (generated when omitted)
    #[arg(short, long)]
    pub device_id: Option<String>,

    /// Log level (overrides config)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

impl CommonArgs {
    /// File (or defaults) + env overrides + CLI overrides, validated
    pub fn load_config(&self) -> Result<SupervisorConfig> {
        let mut config = match &self.config {
            Some(path) => SupervisorConfig::load(path)?,
            None => SupervisorConfig::from_env()?,
        };

        if let Some(url) = &self.url {
            config.transport.url = url.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn access_token(&self) -> Result<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("KEEL_TOKEN").ok())
            .context("No access token: pass --token or set KEEL_TOKEN")
    }
}

/// Initialize tracing/logging
pub fn init_logging(config: &SupervisorConfig) {
    keel_core::utils::init_from_config(&config.logging);
}

/// Print supervisor statistics
pub fn print_stats(stats: &SupervisorStats, snapshot: &ConnectionSnapshot) {
    tracing::info!("=== Connection Statistics ===");
    tracing::info!("Status: {}", snapshot.observed_status);
    tracing::info!("Quality: {}", snapshot.connection_quality.as_str());
    tracing::info!("Resilience state: {}", stats.resilience_state.as_str());
    tracing::info!("Failures since last success: {}", stats.failure_count);
    tracing::info!("Transports created: {}", stats.transports_created);
    tracing::info!(
        "Reconnects: {} attempted, {} succeeded, {} failed, {} suspensions",
        stats.reconnection.reconnection_attempts,
        stats.reconnection.successful_reconnections,
        stats.reconnection.failed_reconnections,
        stats.reconnection.suspensions
    );

    if let Some(uptime) = stats.uptime {
        tracing::info!("Connected for {:.1}s", uptime.as_secs_f64());
    }
    if let Some(error) = &snapshot.last_error {
        tracing::info!("Last error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    struct TestArgs {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = TestArgs::parse_from([
            "keel-monitor",
            "--url",
            "wss://example.test/ws",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        let config = args.common.load_config().unwrap();
        assert_eq!(config.transport.url, "wss://example.test/ws");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_cli_url_rejected() {
        let args = TestArgs::parse_from(["keel-monitor", "--url", "http://example.test"]);
        assert!(args.common.load_config().is_err());
    }

    #[test]
    fn test_explicit_token_wins() {
        let args = TestArgs::parse_from(["keel-monitor", "--token", "abc"]);
        assert_eq!(args.common.access_token().unwrap(), "abc");
    }
}
