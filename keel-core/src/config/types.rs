use super::constants::*;
use crate::core::QualityThresholds;
use crate::resilience::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub transport: TransportConfig,
    pub heartbeat: HeartbeatConfig,
    pub resilience: ResilienceConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

/// Channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint (ws:// or wss://)
    pub url: String,

    /// Channel open timeout
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
        }
    }
}

/// Liveness probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,

    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    pub quality: QualityThresholds,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            quality: QualityThresholds::default(),
        }
    }
}

/// Failure counting and reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub backoff: BackoffConfig,

    /// Scheduled attempts before FAILED
    pub max_attempts: u32,

    /// Consecutive failures before SUSPENDED
    pub failure_threshold: u32,

    /// SUSPENDED cooldown before automatically returning to STABLE
    #[serde(rename = "suspension_timeout_ms", with = "duration_ms")]
    pub suspension_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            failure_threshold: FAILURE_THRESHOLD,
            suspension_timeout: Duration::from_millis(SUSPENSION_TIMEOUT_MS),
        }
    }
}

/// Session RPC configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(SESSION_REQUEST_TIMEOUT_MS),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Enable JSON logging
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            json: false,
        }
    }
}

/// Durations are written as integer milliseconds in config files
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
