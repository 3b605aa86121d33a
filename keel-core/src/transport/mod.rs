//! Bidirectional message channel to the backend
//!
//! A `Transport` owns at most one live channel. Events are delivered through a
//! single receiver handed out once by [`Transport::take_events`]; dropping
//! that receiver (or aborting the task that drains it) detaches the listener,
//! so a superseded transport cannot deliver into a newer lifecycle.

pub mod websocket;

use crate::core::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

/// Close code used when the peer vanished without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Parameters for opening a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub url: String,
    pub access_token: String,
    pub device_id: String,
}

/// Everything a transport reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    /// Text frame from the peer
    Message(String),
    Error(String),
    Closed {
        code: u16,
        reason: String,
        clean: bool,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel
    ///
    /// Idempotent: while connecting or open, returns the current truth
    /// (`Ok(true)` when open, `Ok(false)` while an open is in progress)
    /// without creating a second channel. A stale channel is torn down first.
    async fn connect(&self, params: ConnectParams) -> Result<bool, TransportError>;

    /// Queue a text frame; false if not connected
    fn send(&self, text: String) -> bool;

    /// Close the channel; no-op when already closed
    async fn disconnect(&self, reason: &str);

    fn is_connected(&self) -> bool;

    /// Event receiver; `None` after the first call
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

/// Builds a fresh transport for each connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Transport>;
}
