//! Collaborators the supervisor consumes but does not own
//!
//! - `AuthProvider`: credential state and the "auth initialized" signal
//! - `StateSink`: write target for the published connection snapshot
//! - `DeviceIdentity`: process-wide device id, injected instead of a global
//!
//! Notifications live in `monitoring::notifications`.

use crate::core::ConnectionSnapshot;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

/// Lifecycle signals from the auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// Auth state has been loaded for the first time
    Initialized,
    /// A fresh authentication happened (login or token refresh)
    Refreshed,
    /// Credentials are gone (logout, revocation, refresh failure)
    SignedOut,
}

/// Credential source
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Current access token, if any
    async fn access_token(&self) -> Option<String>;

    /// Whether the "auth initialized" signal has already fired
    fn is_initialized(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Write target for connection state, updated on every transition
pub trait StateSink: Send + Sync {
    fn publish(&self, snapshot: &ConnectionSnapshot);
}

/// State sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStateSink;

impl StateSink for TracingStateSink {
    fn publish(&self, snapshot: &ConnectionSnapshot) {
        debug!(
            status = %snapshot.observed_status,
            quality = snapshot.connection_quality.as_str(),
            recovering = snapshot.is_recovering,
            attempt = snapshot.recovery_attempt,
            aux = ?snapshot.aux_status,
            last_error = ?snapshot.last_error,
            "connection state published"
        );
    }
}

/// Process-wide device identity
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> Option<String>;
    fn set_device_id(&self, id: String);
    fn clear(&self);
}

/// Device identity held in memory
#[derive(Debug, Default)]
pub struct InMemoryIdentity {
    id: RwLock<Option<String>>,
}

impl InMemoryIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RwLock::new(Some(id.into())),
        }
    }

    /// Fresh random identity
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl DeviceIdentity for InMemoryIdentity {
    fn device_id(&self) -> Option<String> {
        self.id.read().clone()
    }

    fn set_device_id(&self, id: String) {
        *self.id.write() = Some(id);
    }

    fn clear(&self) {
        *self.id.write() = None;
    }
}

/// Auth provider backed by a fixed token, for tools and services that are
/// handed a credential up front
pub struct StaticTokenAuth {
    token: RwLock<Option<String>>,
    initialized: AtomicBool,
    events: broadcast::Sender<AuthEvent>,
}

impl StaticTokenAuth {
    /// Already initialized with the given token
    pub fn new(token: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            token: RwLock::new(Some(token.into())),
            initialized: AtomicBool::new(true),
            events,
        }
    }

    /// Replace the token; `None` signs out
    pub fn set_token(&self, token: Option<String>) {
        let signed_in = token.is_some();
        *self.token.write() = token;
        let _ = self.events.send(if signed_in {
            AuthEvent::Refreshed
        } else {
            AuthEvent::SignedOut
        });
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    async fn access_token(&self) -> Option<String> {
        self.token.read().clone()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_clear_and_set() {
        let identity = InMemoryIdentity::new("device-1");
        assert_eq!(identity.device_id().as_deref(), Some("device-1"));

        identity.clear();
        assert!(identity.device_id().is_none());

        identity.set_device_id("device-2".to_string());
        assert_eq!(identity.device_id().as_deref(), Some("device-2"));
    }

    #[test]
    fn test_generated_identity_is_unique() {
        let a = InMemoryIdentity::generate();
        let b = InMemoryIdentity::generate();
        assert_ne!(a.device_id(), b.device_id());
    }

    #[tokio::test]
    async fn test_static_token_sign_out_emits_event() {
        let auth = StaticTokenAuth::new("token");
        let mut rx = auth.subscribe();
        assert!(auth.is_initialized());
        assert!(auth.is_authenticated());
        assert_eq!(auth.access_token().await.as_deref(), Some("token"));

        auth.set_token(None);
        assert!(!auth.is_authenticated());
        assert_eq!(rx.recv().await.unwrap(), AuthEvent::SignedOut);
    }
}
