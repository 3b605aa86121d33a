//! Monitoring and observability
//!
//! Prometheus metrics for the supervised connection and the user-facing
//! notification channel.

pub mod metrics;
pub mod notifications;

pub use metrics::ConnectionMetrics;
pub use notifications::{Notification, NotificationLevel, Notifier, TracingNotifier};
