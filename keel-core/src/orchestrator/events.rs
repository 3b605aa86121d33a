//! What the supervisor tells the application

use crate::core::{ConnectionQuality, ObservedStatus};
use crate::monitoring::Notification;
use crate::resilience::{ReconnectionStats, ResilienceState};
use serde_json::Value;
use std::time::Duration;

/// Broadcast to every [`subscribe`](super::ConnectionOrchestrator::subscribe)r
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StatusChanged {
        from: ObservedStatus,
        to: ObservedStatus,
    },
    QualityChanged(ConnectionQuality),
    /// Business payload from the backend, routed untouched
    Message { kind: String, payload: Value },
    /// Server rejected this device; no reconnect until fresh authentication
    IdentityInvalidated,
    /// Copy of every user-facing notification
    Notice(Notification),
}

/// Point-in-time supervisor statistics
#[derive(Debug, Clone)]
pub struct SupervisorStats {
    pub reconnection: ReconnectionStats,
    pub resilience_state: ResilienceState,
    pub failure_count: u32,
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    pub transports_created: u64,
}
