//! Keel Core - Resilient Connection Supervisor
//!
//! Keel owns a single logical real-time connection to a trading backend,
//! keeps it alive across network failures, and exposes a declarative
//! desired-state API to the rest of the application.
//!
//! ## Architecture
//! - **Transport**: one bidirectional message channel (WebSocket in production)
//! - **Heartbeat**: application-level liveness probe with ack timeout
//! - **Resilience**: failure counting, backoff with jitter, suspension
//! - **Session**: request/response handshake correlated by request id
//! - **Orchestrator**: reconciles desired vs observed state over all of the above
//!
//! ## Core Modules
//! - `core`: value types and the error taxonomy
//! - `config`: supervisor configuration with defaults and env overrides
//! - `transport`: `Transport` trait and the `tokio-tungstenite` implementation
//! - `heartbeat`: `HeartbeatMonitor`
//! - `resilience`: `ResilienceEngine` and exponential backoff
//! - `session`: `SessionClient`
//! - `orchestrator`: `ConnectionOrchestrator`
//! - `interfaces`: auth provider, state sink and device identity traits
//! - `monitoring`: Prometheus metrics and user notifications
//! - `testing`: mocks and recorders for tests (`testing` feature)

pub mod config;
pub mod core;
pub mod heartbeat;
pub mod interfaces;
pub mod monitoring;
pub mod orchestrator;
pub mod protocol;
pub mod resilience;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod utils;

// Re-export core types
pub use core::{
    AuxStatus, ConnectionQuality, ConnectionSnapshot, DesiredState, DesiredStatePatch,
    DisconnectReason, FailureKind, HandshakeError, ObservedStatus, SupervisorError,
    TransportError, TransportId,
};

pub use config::SupervisorConfig;
pub use heartbeat::{HeartbeatEvent, HeartbeatEventKind, HeartbeatMonitor, HeartbeatRecord};
pub use interfaces::{AuthEvent, AuthProvider, DeviceIdentity, StateSink};
pub use monitoring::{ConnectionMetrics, Notification, NotificationLevel, Notifier};
pub use orchestrator::{ConnectionOrchestrator, OrchestratorBuilder, SupervisorEvent, SupervisorStats};
pub use resilience::{BackoffConfig, ResilienceEngine, ResilienceEvent, ResilienceState};
pub use session::SessionClient;
pub use transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};

// Re-export error types
pub use anyhow::{Error, Result};
