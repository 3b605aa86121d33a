//! Recording sinks and small async helpers for tests

use crate::core::{ConnectionSnapshot, ObservedStatus};
use crate::interfaces::StateSink;
use crate::monitoring::{Notification, NotificationLevel, Notifier};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;

/// Keeps every published snapshot
#[derive(Default)]
pub struct RecordingStateSink {
    snapshots: Mutex<Vec<ConnectionSnapshot>>,
}

impl RecordingStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.snapshots.lock().clone()
    }

    pub fn last(&self) -> Option<ConnectionSnapshot> {
        self.snapshots.lock().last().cloned()
    }

    /// Observed statuses with consecutive repeats collapsed
    pub fn statuses(&self) -> Vec<ObservedStatus> {
        let mut statuses: Vec<ObservedStatus> = Vec::new();
        for snapshot in self.snapshots.lock().iter() {
            if statuses.last() != Some(&snapshot.observed_status) {
                statuses.push(snapshot.observed_status);
            }
        }
        statuses
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

impl StateSink for RecordingStateSink {
    fn publish(&self, snapshot: &ConnectionSnapshot) {
        self.snapshots.lock().push(snapshot.clone());
    }
}

/// Keeps every notification
#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn count_level(&self, level: NotificationLevel) -> usize {
        self.notifications
            .lock()
            .iter()
            .filter(|n| n.level == level)
            .count()
    }

    pub fn contains_title(&self, title: &str) -> bool {
        self.notifications.lock().iter().any(|n| n.title == title)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}

/// Let spawned tasks run until `condition` holds, advancing paused time in
/// small steps. Panics after `limit` of (virtual) time.
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(1);
    let mut waited = Duration::ZERO;
    while !condition() {
        assert!(waited < limit, "condition not met within {:?}", limit);
        tokio::time::sleep(step).await;
        waited += step;
    }
}

/// Run a future to completion, then give spawned tasks a chance to settle
pub async fn settle<F: Future>(future: F) -> F::Output {
    let output = future.await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    output
}
