//! Controllable auth provider

use crate::interfaces::{AuthEvent, AuthProvider};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

pub struct MockAuth {
    authenticated: AtomicBool,
    initialized: AtomicBool,
    token_available: AtomicBool,
    events: broadcast::Sender<AuthEvent>,
}

impl MockAuth {
    fn with_flags(authenticated: bool, initialized: bool) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            authenticated: AtomicBool::new(authenticated),
            initialized: AtomicBool::new(initialized),
            token_available: AtomicBool::new(true),
            events,
        }
    }

    /// Initialized and signed in
    pub fn authenticated() -> Self {
        Self::with_flags(true, true)
    }

    /// Initialized, nobody signed in
    pub fn signed_out() -> Self {
        Self::with_flags(false, true)
    }

    /// Signed in, but the provider has not finished loading yet
    pub fn uninitialized() -> Self {
        Self::with_flags(true, false)
    }

    /// Finish loading and announce it
    pub fn initialize(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        let _ = self.events.send(AuthEvent::Initialized);
    }

    pub fn sign_out(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        let _ = self.events.send(AuthEvent::SignedOut);
    }

    /// Session expires without the provider announcing it
    pub fn lapse(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }

    /// Fresh authentication
    pub fn refresh(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
        self.token_available.store(true, Ordering::SeqCst);
        let _ = self.events.send(AuthEvent::Refreshed);
    }

    /// Stay "authenticated" but hand out no token
    pub fn withhold_token(&self) {
        self.token_available.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuthProvider for MockAuth {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn access_token(&self) -> Option<String> {
        (self.is_authenticated() && self.token_available.load(Ordering::SeqCst))
            .then(|| "test-token".to_string())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}
