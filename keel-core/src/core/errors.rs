//! Error taxonomy for the connection supervisor
//!
//! Errors are split by where they originate so the orchestrator can decide
//! how to react:
//! - `TransportError`: the channel could not be opened, written or closed
//! - `HandshakeError`: the session request failed or returned garbage
//! - `SupervisorError`: everything the orchestrator reports upward, including
//!   liveness loss, identity invalidation and missing credentials
//!
//! Transport, handshake and liveness failures are recoverable and feed the
//! resilience engine. Identity invalidation is terminal for the session.
//! Missing credentials block attempts but are never counted as failures.

use std::time::Duration;
use thiserror::Error;

/// Failures of the underlying message channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server URL or request headers could not be built
    #[error("invalid connection request: {0}")]
    InvalidRequest(String),

    /// Opening the channel failed
    #[error("failed to open channel: {0}")]
    ConnectFailed(String),

    /// Opening the channel did not finish in time
    #[error("channel open timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The open was abandoned because the transport was torn down meanwhile
    #[error("connection attempt aborted: {0}")]
    Aborted(String),

    /// A write was attempted on a channel that is not open
    #[error("channel is not connected")]
    NotConnected,

    /// The channel closed underneath us
    #[error("channel closed (code {code}): {reason}")]
    Closed {
        /// Close code reported by the peer (1006 for abnormal closure)
        code: u16,
        /// Close reason reported by the peer
        reason: String,
    },
}

/// Failures of the post-connect session exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The request could not be written to the transport
    #[error("session request could not be sent")]
    SendFailed,

    /// No matching response arrived in time
    #[error("session request {request_id} timed out after {timeout:?}")]
    Timeout {
        /// Correlation id of the request
        request_id: String,
        /// How long we waited
        timeout: Duration,
    },

    /// The server answered with an error
    #[error("session rejected by server: {0}")]
    Rejected(String),

    /// The server answered but the payload is unusable
    #[error("invalid session payload: {0}")]
    InvalidPayload(String),

    /// The transport went away while the request was outstanding
    #[error("session request cancelled: {0}")]
    Cancelled(String),
}

/// Coarse failure classes recorded by the resilience engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Channel open/write/close failure
    Transport,
    /// Session request failed during initial connect
    Handshake,
    /// Heartbeat ack not received in time
    Liveness,
    /// Session re-validation failed after a successful reconnect
    Revalidation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Handshake => "handshake",
            Self::Liveness => "liveness",
            Self::Revalidation => "revalidation",
        }
    }
}

/// Errors surfaced by the connection orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Heartbeat acknowledgement not received within the timeout
    #[error("liveness lost: no heartbeat ack within {0:?}")]
    LivenessTimeout(Duration),

    /// Server declared the device/session no longer valid
    #[error("device identity invalidated by server")]
    IdentityInvalidated,

    /// No valid credential is available
    #[error("authentication required")]
    AuthRequired,

    /// The supervisor has been disposed
    #[error("supervisor disposed")]
    Disposed,

    /// A newer connection attempt replaced this one
    #[error("connection attempt superseded")]
    Superseded,
}

impl SupervisorError {
    /// Whether this failure should feed the resilience engine and allow retries
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Handshake(_) | Self::LivenessTimeout(_)
        )
    }

    /// Failure class to record, or `None` for errors that are not counted
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Transport(_) => Some(FailureKind::Transport),
            Self::Handshake(_) => Some(FailureKind::Handshake),
            Self::LivenessTimeout(_) => Some(FailureKind::Liveness),
            Self::IdentityInvalidated | Self::AuthRequired | Self::Disposed | Self::Superseded => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(SupervisorError::from(TransportError::NotConnected).is_recoverable());
        assert!(SupervisorError::from(HandshakeError::SendFailed).is_recoverable());
        assert!(SupervisorError::LivenessTimeout(Duration::from_secs(1)).is_recoverable());

        assert!(!SupervisorError::IdentityInvalidated.is_recoverable());
        assert!(!SupervisorError::AuthRequired.is_recoverable());
        assert!(!SupervisorError::Disposed.is_recoverable());
    }

    #[test]
    fn test_auth_required_is_not_counted() {
        assert_eq!(SupervisorError::AuthRequired.failure_kind(), None);
        assert_eq!(
            SupervisorError::from(HandshakeError::Rejected("nope".into())).failure_kind(),
            Some(FailureKind::Handshake)
        );
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::Closed {
            code: 1006,
            reason: "reset".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("1006"));
        assert!(msg.contains("reset"));

        let err: SupervisorError = err.into();
        assert!(format!("{}", err).contains("channel closed"));
    }
}
