//! Connection orchestrator
//!
//! Top-level supervisor that reconciles the application's desired state with
//! the observed state of a single real-time connection.
//!
//! ```text
//!  set_desired_state() ──→ reconcile ──→ connect() ──→ Transport::connect
//!                                                        │
//!                                   session handshake ◄──┘
//!                                          │
//!                          CONNECTED + heartbeat start + aux reconcile
//!
//!  socket drop / heartbeat timeout ──→ disconnect(reason)
//!        ──→ ResilienceEngine::record_failure + attempt_reconnection
//!        ──→ (delay) fresh Transport ──→ handshake again ──→ CONNECTED
//! ```
//!
//! The orchestrator must be built inside a tokio runtime. Dropping it
//! disposes it; call [`ConnectionOrchestrator::dispose`] to also close the
//! transport gracefully.

pub mod events;
mod supervisor;

pub use events::{SupervisorEvent, SupervisorStats};

use crate::config::SupervisorConfig;
use crate::core::{
    ConnectionSnapshot, DesiredState, DesiredStatePatch, DisconnectReason, ObservedStatus,
    SessionHandle,
};
use crate::heartbeat::HeartbeatRecord;
use crate::interfaces::{
    AuthProvider, DeviceIdentity, InMemoryIdentity, StateSink, TracingStateSink,
};
use crate::monitoring::{ConnectionMetrics, Notifier, TracingNotifier};
use crate::resilience::ResilienceEngine;
use crate::transport::TransportFactory;
use serde_json::Value;
use std::sync::Arc;
use supervisor::{Supervisor, SupervisorParts};
use tokio::sync::broadcast;

/// Resilient connection supervisor
pub struct ConnectionOrchestrator {
    inner: Arc<Supervisor>,
}

impl ConnectionOrchestrator {
    pub fn builder(
        config: SupervisorConfig,
        factory: Arc<dyn TransportFactory>,
        auth: Arc<dyn AuthProvider>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            factory,
            auth,
            identity: None,
            sink: None,
            notifier: None,
            metrics: None,
        }
    }

    /// Merge `patch` into the desired state and reconcile
    ///
    /// Before the auth provider has signalled initialization the
    /// reconciliation is deferred; it runs once when the signal arrives.
    pub async fn set_desired_state(&self, patch: DesiredStatePatch) {
        self.inner.set_desired_state(patch).await;
    }

    /// Open the transport and validate the session
    ///
    /// Returns the best-known connected flag without doing anything when
    /// disposed, unauthenticated, blocked by identity invalidation, or already
    /// connected/connecting/recovering.
    pub async fn connect(&self) -> bool {
        self.inner.connect().await
    }

    /// Tear the connection down; idempotent
    pub async fn disconnect(&self, reason: DisconnectReason) {
        self.inner.disconnect(reason).await;
    }

    /// Ask the resilience engine to schedule a reconnect
    pub fn attempt_recovery(&self, reason: &str) -> bool {
        self.inner.attempt_recovery(reason)
    }

    /// Stop everything; later calls to any method are safe no-ops
    pub async fn dispose(&self) {
        if let Some(Some(transport)) = self.inner.shutdown() {
            transport.disconnect(DisconnectReason::Disposed.as_str()).await;
        }
    }

    /// Forward an application payload; false unless connected
    pub fn send(&self, payload: &Value) -> bool {
        self.inner.send(payload)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.snapshot()
    }

    pub fn status(&self) -> ObservedStatus {
        self.inner.status()
    }

    pub fn desired_state(&self) -> DesiredState {
        self.inner.desired_state()
    }

    /// Session of the live connection
    pub fn session(&self) -> Option<SessionHandle> {
        self.inner.session_handle()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.inner.stats()
    }

    pub fn heartbeat_record(&self) -> HeartbeatRecord {
        self.inner.heartbeat.record()
    }

    pub fn resilience(&self) -> &ResilienceEngine {
        &self.inner.engine
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl Drop for ConnectionOrchestrator {
    fn drop(&mut self) {
        // Releases the event loop's reference; the transport closes on drop
        let _ = self.inner.shutdown();
    }
}

/// Collaborators for a [`ConnectionOrchestrator`]
pub struct OrchestratorBuilder {
    config: SupervisorConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthProvider>,
    identity: Option<Arc<dyn DeviceIdentity>>,
    sink: Option<Arc<dyn StateSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    metrics: Option<ConnectionMetrics>,
}

impl OrchestratorBuilder {
    /// Defaults to a freshly generated in-memory identity
    pub fn identity(mut self, identity: Arc<dyn DeviceIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Defaults to [`TracingStateSink`]
    pub fn state_sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Defaults to [`TracingNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn metrics(mut self, metrics: ConnectionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns the event loop; must run inside a tokio runtime
    pub fn build(self) -> ConnectionOrchestrator {
        let inner = Supervisor::start(SupervisorParts {
            config: self.config,
            factory: self.factory,
            auth: self.auth,
            identity: self
                .identity
                .unwrap_or_else(|| Arc::new(InMemoryIdentity::generate())),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingStateSink)),
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(TracingNotifier::default())),
            metrics: self.metrics,
        });
        ConnectionOrchestrator { inner }
    }
}
