//! Shared value types for the connection supervisor
//!
//! Everything here is plain data: desired state owned by the application,
//! observed status owned by the orchestrator, and the snapshot published to
//! the state sink.

use crate::config::constants;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// What the application wants the connection to look like
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Keep a live session to the backend
    pub connected: bool,
    /// Keep the auxiliary server-side service running
    pub aux_service_running: bool,
}

/// Partial update merged into [`DesiredState`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesiredStatePatch {
    pub connected: Option<bool>,
    pub aux_service_running: Option<bool>,
}

impl DesiredStatePatch {
    pub fn connected(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            aux_service_running: None,
        }
    }

    pub fn aux_service_running(running: bool) -> Self {
        Self {
            connected: None,
            aux_service_running: Some(running),
        }
    }
}

impl DesiredState {
    /// Merge a patch, returning true if anything changed
    pub fn merge(&mut self, patch: DesiredStatePatch) -> bool {
        let before = *self;
        if let Some(connected) = patch.connected {
            self.connected = connected;
        }
        if let Some(running) = patch.aux_service_running {
            self.aux_service_running = running;
        }
        before != *self
    }
}

/// The orchestrator's best knowledge of the actual connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservedStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

impl ObservedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Recovering => "RECOVERING",
        }
    }

    /// Numeric encoding used by the status gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Recovering => 3,
        }
    }
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency bucket derived from heartbeat round trips
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    #[default]
    Disconnected,
}

/// Upper latency bounds (inclusive, milliseconds) for each quality bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent_ms: i64,
    pub good_ms: i64,
    pub fair_ms: i64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent_ms: constants::QUALITY_EXCELLENT_MS,
            good_ms: constants::QUALITY_GOOD_MS,
            fair_ms: constants::QUALITY_FAIR_MS,
        }
    }
}

impl ConnectionQuality {
    /// Bucket a measured latency. Negative latency means the measurement is
    /// unusable (clock skew or a bogus echo).
    pub fn from_latency(latency_ms: i64, thresholds: &QualityThresholds) -> Self {
        if latency_ms < 0 {
            Self::Disconnected
        } else if latency_ms <= thresholds.excellent_ms {
            Self::Excellent
        } else if latency_ms <= thresholds.good_ms {
            Self::Good
        } else if latency_ms <= thresholds.fair_ms {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "EXCELLENT",
            Self::Good => "GOOD",
            Self::Fair => "FAIR",
            Self::Poor => "POOR",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

/// State of the auxiliary server-side service, as reported by the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxStatus {
    Running,
    Stopped,
    #[default]
    #[serde(other)]
    Unknown,
}

impl AuxStatus {
    /// Whether this observation matches the desired running flag.
    /// `Unknown` never matches, so reconciliation asks the server.
    pub fn matches(&self, want_running: bool) -> bool {
        match self {
            Self::Running => want_running,
            Self::Stopped => !want_running,
            Self::Unknown => false,
        }
    }
}

/// Result of a successful session handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub device_id: String,
    pub aux_status: AuxStatus,
    /// Expiry as unix milliseconds, when the server provides one
    pub expires_at: Option<i64>,
}

/// Why the connection is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Application asked for it (desired state flipped to disconnected)
    UserRequested,
    /// User logged out
    Logout,
    /// Authentication was lost or revoked
    AuthLost,
    /// Server rejected the device identity
    IdentityInvalidated,
    /// Supervisor is being disposed
    Disposed,
    /// The socket dropped without being asked to
    SocketDropped,
    /// Heartbeat ack did not arrive in time
    LivenessTimeout,
    /// Session could not be re-validated after a reconnect
    SessionRevalidationFailed,
}

impl DisconnectReason {
    /// Clean reasons reset recovery bookkeeping and never schedule a retry
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            Self::UserRequested
                | Self::Logout
                | Self::AuthLost
                | Self::IdentityInvalidated
                | Self::Disposed
        )
    }

    pub fn will_retry(&self) -> bool {
        !self.is_clean()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequested => "user_requested",
            Self::Logout => "logout",
            Self::AuthLost => "auth_lost",
            Self::IdentityInvalidated => "identity_invalidated",
            Self::Disposed => "disposed",
            Self::SocketDropped => "socket_dropped",
            Self::LivenessTimeout => "liveness_timeout",
            Self::SessionRevalidationFailed => "session_revalidation_failed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the state sink gets on each transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub observed_status: ObservedStatus,
    pub connection_quality: ConnectionQuality,
    pub is_recovering: bool,
    pub recovery_attempt: u32,
    pub aux_status: AuxStatus,
    pub last_error: Option<String>,
}

/// Identity of one transport instance, compared on every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport#{}", self.0)
    }
}

/// Wall clock in unix milliseconds (heartbeat timestamps are wall-clock)
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
