//! Centralized defaults for the connection supervisor
//!
//! Every tunable has exactly one default here; config structs resolve them
//! once at construction.

// ===== TRANSPORT =====

/// Default backend endpoint
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";

/// Channel open timeout
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

// ===== HEARTBEAT =====

/// Interval between liveness probes
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Time allowed for a probe acknowledgement
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Latency bucket upper bounds (inclusive)
pub const QUALITY_EXCELLENT_MS: i64 = 150;
pub const QUALITY_GOOD_MS: i64 = 500;
pub const QUALITY_FAIR_MS: i64 = 1_000;

// ===== RESILIENCE =====

/// First reconnect delay
pub const BACKOFF_INITIAL_DELAY_MS: u64 = 1_000;

/// Upper bound on any reconnect delay
pub const BACKOFF_MAX_DELAY_MS: u64 = 30_000;

/// Growth per attempt
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Uniform jitter as a fraction of the base delay (±)
pub const BACKOFF_JITTER_FACTOR: f64 = 0.3;

/// Scheduled attempts before the engine gives up (FAILED)
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Consecutive failures before attempts are paused (SUSPENDED)
pub const FAILURE_THRESHOLD: u32 = 5;

/// Length of the suspension cooldown
pub const SUSPENSION_TIMEOUT_MS: u64 = 300_000;

// ===== SESSION =====

/// Time allowed for a correlated session response
pub const SESSION_REQUEST_TIMEOUT_MS: u64 = 15_000;

// ===== LOGGING =====

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "KEEL_";
