//! Test doubles for the supervisor's collaborators
//!
//! - `MockTransport` / `MockTransportFactory`: scripted connects, captured
//!   sends, a programmable server side
//! - `MockAuth`: auth provider driven by the test
//! - `RecordingStateSink` / `RecordingNotifier`: capture what the supervisor
//!   publishes

pub mod helpers;
pub mod mock_auth;
pub mod mock_transport;

pub use helpers::{settle, wait_until, RecordingNotifier, RecordingStateSink};
pub use mock_auth::MockAuth;
pub use mock_transport::{
    default_responder, responder_overriding, ConnectOutcome, MockTransport, MockTransportFactory,
    Responder,
};
