//! Core value and error types shared by every supervisor component
//!
//! - `types`: desired/observed state, quality buckets, disconnect reasons
//! - `errors`: transport, handshake and supervisor error taxonomy

pub mod errors;
pub mod types;

// Re-export commonly used types
pub use errors::{FailureKind, HandshakeError, SupervisorError, TransportError};
pub use types::{
    unix_millis, AuxStatus, ConnectionQuality, ConnectionSnapshot, DesiredState,
    DesiredStatePatch, DisconnectReason, ObservedStatus, QualityThresholds, SessionHandle,
    TransportId,
};
