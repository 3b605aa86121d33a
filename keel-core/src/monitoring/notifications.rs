//! User-facing notifications
//!
//! The supervisor reports what a user should see (reconnecting, suspended,
//! identity invalidated, gave up) through a [`Notifier`]. Delivery is
//! fire-and-forget; a notifier must never block the caller.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info = 0,
    Success = 1,
    Warning = 2,
    Error = 3,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// A message for the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    /// Needs acknowledgement before anything else happens (e.g. re-login)
    pub blocking: bool,
    pub timestamp: SystemTime,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
            blocking: false,
            timestamp: SystemTime::now(),
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Success, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NotificationLevel::Error, title, message)
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Format for display
    pub fn format(&self) -> String {
        format!("[{}] {}: {}", self.level.as_str(), self.title, self.message)
    }
}

/// Sink for user-facing notifications
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Routes notifications into `tracing`, suppressing repeats of the same
/// title within `rate_limit`
pub struct TracingNotifier {
    rate_limit: Duration,
    last_sent: Mutex<HashMap<String, SystemTime>>,
}

impl TracingNotifier {
    pub fn new(rate_limit: Duration) -> Self {
        Self {
            rate_limit,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn should_send(&self, notification: &Notification) -> bool {
        // Errors always go through
        if notification.level == NotificationLevel::Error || notification.blocking {
            return true;
        }

        let mut last_sent = self.last_sent.lock();
        if let Some(at) = last_sent.get(&notification.title) {
            if let Ok(elapsed) = notification.timestamp.duration_since(*at) {
                if elapsed < self.rate_limit {
                    return false;
                }
            }
        }
        last_sent.insert(notification.title.clone(), notification.timestamp);
        true
    }
}

impl Default for TracingNotifier {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        if !self.should_send(&notification) {
            debug!("Notification '{}' rate limited", notification.title);
            return;
        }

        let formatted = notification.format();
        match notification.level {
            NotificationLevel::Info | NotificationLevel::Success => info!("{}", formatted),
            NotificationLevel::Warning => warn!("{}", formatted),
            NotificationLevel::Error => error!(blocking = notification.blocking, "{}", formatted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_format() {
        let n = Notification::warning("Connection suspended", "resuming at 12:00");
        assert_eq!(n.format(), "[WARN] Connection suspended: resuming at 12:00");
        assert!(!n.blocking);
        assert!(Notification::error("Signed out", "log in again").blocking().blocking);
    }

    #[test]
    fn test_level_ordering() {
        assert!(NotificationLevel::Error > NotificationLevel::Warning);
        assert!(NotificationLevel::Warning > NotificationLevel::Success);
        assert!(NotificationLevel::Success > NotificationLevel::Info);
    }

    #[test]
    fn test_rate_limit_suppresses_repeats() {
        let notifier = TracingNotifier::new(Duration::from_secs(60));
        let first = Notification::info("Reconnecting", "attempt 1/10");
        assert!(notifier.should_send(&first));
        assert!(!notifier.should_send(&Notification::info("Reconnecting", "attempt 2/10")));
        assert!(notifier.should_send(&Notification::info("Connected", "back online")));
    }

    #[test]
    fn test_errors_bypass_rate_limit() {
        let notifier = TracingNotifier::new(Duration::from_secs(60));
        assert!(notifier.should_send(&Notification::error("Gave up", "x")));
        assert!(notifier.should_send(&Notification::error("Gave up", "x")));
    }
}
