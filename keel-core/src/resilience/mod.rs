//! Resilience patterns for the supervised connection
//!
//! - Exponential backoff with jitter for reconnect delays
//! - Failure counting with threshold-based suspension
//! - A reconnect scheduler that never stacks timers

pub mod backoff;
pub mod engine;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use engine::{
    FailureInfo, ReconnectFn, ReconnectFuture, ReconnectionStats, ResilienceEngine,
    ResilienceEvent, ResilienceState,
};
