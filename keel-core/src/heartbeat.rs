//! Application-level liveness probe
//!
//! One tokio task per run owns the probe interval and the ack deadline inside
//! a single `select!`, so there is never more than one outstanding deadline.
//! Acks are fed in through a channel by the owner's message router. Every
//! event carries the run number of the `start()` that produced it; `stop()`
//! and `start()` both advance the run so the owner can drop late events.

use crate::config::HeartbeatConfig;
use crate::core::{unix_millis, AuxStatus, ConnectionQuality};
use crate::protocol::{ClientMessage, HeartbeatAck};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Timing of the most recent probe/ack pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// Unix millis of the last probe sent
    pub last_sent_at: Option<i64>,
    /// Unix millis of the last ack received
    pub last_ack_at: Option<i64>,
    pub latency_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEventKind {
    Ack {
        latency_ms: i64,
        quality: ConnectionQuality,
        identity_valid: bool,
        aux_status: Option<AuxStatus>,
    },
    /// No ack within the timeout; the run has ended
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatEvent {
    pub run: u64,
    pub kind: HeartbeatEventKind,
}

struct MonitorState {
    run: u64,
    task: Option<JoinHandle<()>>,
    acks: Option<mpsc::UnboundedSender<HeartbeatAck>>,
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    state: Mutex<MonitorState>,
    record: Arc<Mutex<HeartbeatRecord>>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, events: mpsc::UnboundedSender<HeartbeatEvent>) -> Self {
        Self {
            config,
            events,
            state: Mutex::new(MonitorState {
                run: 0,
                task: None,
                acks: None,
            }),
            record: Arc::new(Mutex::new(HeartbeatRecord::default())),
        }
    }

    /// Begin probing; replaces any previous run. Returns the new run number.
    pub fn start(&self, transport: Arc<dyn Transport>, device_id: String) -> u64 {
        let mut st = self.state.lock();
        Self::halt(&mut st);

        st.run += 1;
        let run = st.run;
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        st.acks = Some(acks_tx);
        *self.record.lock() = HeartbeatRecord::default();

        debug!(run, interval = ?self.config.interval, "Starting heartbeat");
        st.task = Some(tokio::spawn(run_loop(
            run,
            self.config.clone(),
            transport,
            device_id,
            acks_rx,
            self.events.clone(),
            Arc::clone(&self.record),
        )));
        run
    }

    /// Cancel the interval and any outstanding deadline
    pub fn stop(&self) {
        let mut st = self.state.lock();
        if Self::halt(&mut st) {
            st.run += 1;
            debug!("Heartbeat stopped");
        }
    }

    fn halt(st: &mut MonitorState) -> bool {
        st.acks = None;
        match st.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Route an ack to the running probe loop
    pub fn handle_ack(&self, ack: HeartbeatAck) {
        let st = self.state.lock();
        match &st.acks {
            Some(acks) => {
                let _ = acks.send(ack);
            }
            None => trace!("Dropping heartbeat ack, monitor not running"),
        }
    }

    pub fn current_run(&self) -> u64 {
        self.state.lock().run
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn record(&self) -> HeartbeatRecord {
        *self.record.lock()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        Self::halt(&mut self.state.lock());
    }
}

async fn run_loop(
    run: u64,
    config: HeartbeatConfig,
    transport: Arc<dyn Transport>,
    device_id: String,
    mut acks: mpsc::UnboundedReceiver<HeartbeatAck>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    record: Arc<Mutex<HeartbeatRecord>>,
) {
    // First tick completes immediately
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<Instant> = None;

    loop {
        let timeout = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = ticker.tick() => {
                if !transport.is_connected() {
                    trace!(run, "Skipping probe, transport not connected");
                    continue;
                }
                let now = unix_millis();
                let probe = ClientMessage::Heartbeat {
                    timestamp: now,
                    device_id: device_id.clone(),
                };
                let text = match probe.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode heartbeat probe: {}", e);
                        continue;
                    }
                };
                if transport.send(text) {
                    record.lock().last_sent_at = Some(now);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + config.timeout);
                    }
                    trace!(run, "Heartbeat probe sent");
                }
            }
            Some(ack) = acks.recv() => {
                deadline = None;
                let now = unix_millis();
                let latency_ms = now - ack.client_timestamp;
                let quality = ConnectionQuality::from_latency(latency_ms, &config.quality);
                {
                    let mut rec = record.lock();
                    rec.last_ack_at = Some(now);
                    rec.latency_ms = Some(latency_ms);
                }
                trace!(run, latency_ms, quality = quality.as_str(), "Heartbeat ack");
                let _ = events.send(HeartbeatEvent {
                    run,
                    kind: HeartbeatEventKind::Ack {
                        latency_ms,
                        quality,
                        identity_valid: ack.identity_valid,
                        aux_status: ack.aux_status,
                    },
                });
            }
            _ = timeout => {
                warn!(run, timeout = ?config.timeout, "Heartbeat ack timed out");
                let _ = events.send(HeartbeatEvent {
                    run,
                    kind: HeartbeatEventKind::Timeout,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            ..HeartbeatConfig::default()
        }
    }

    fn connected_transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::silent());
        transport.force_connected(true);
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_sent_immediately_and_on_interval() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(config(), tx);
        let transport = connected_transport();

        monitor.start(transport.clone(), "dev-1".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.sent_of_type("heartbeat").len(), 1);
        assert!(monitor.record().last_sent_at.is_some());

        // Ack so the deadline does not fire
        monitor.handle_ack(HeartbeatAck {
            client_timestamp: unix_millis(),
            identity_valid: true,
            aux_status: None,
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.sent_of_type("heartbeat").len(), 2);
        assert_eq!(transport.sent_of_type("heartbeat")[0]["deviceId"], "dev-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_reports_latency_and_quality() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(config(), tx);
        let run = monitor.start(connected_transport(), "dev-1".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;

        monitor.handle_ack(HeartbeatAck {
            client_timestamp: unix_millis() - 40,
            identity_valid: true,
            aux_status: Some(AuxStatus::Running),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.run, run);
        match event.kind {
            HeartbeatEventKind::Ack {
                latency_ms,
                quality,
                identity_valid,
                aux_status,
            } => {
                assert!(latency_ms >= 40);
                assert_eq!(quality, ConnectionQuality::Excellent);
                assert!(identity_valid);
                assert_eq!(aux_status, Some(AuxStatus::Running));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(monitor.record().latency_ms.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(config(), tx);
        let run = monitor.start(connected_transport(), "dev-1".to_string());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            HeartbeatEvent {
                run,
                kind: HeartbeatEventKind::Timeout
            }
        );
        assert!(!monitor.is_running());

        // Run ended; nothing else arrives
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_probe_while_disconnected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(config(), tx);
        let transport = Arc::new(MockTransport::silent());

        monitor.start(transport.clone(), "dev-1".to_string());
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(transport.sent().is_empty());
        // No probe means no deadline
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_deadline_and_advances_run() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(config(), tx);
        let run = monitor.start(connected_transport(), "dev-1".to_string());
        tokio::time::sleep(Duration::from_millis(1)).await;

        monitor.stop();
        monitor.stop();
        assert!(monitor.current_run() > run);
        assert!(!monitor.is_running());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_run() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::new(config(), tx);
        let transport = connected_transport();

        let first = monitor.start(transport.clone(), "dev-1".to_string());
        let second = monitor.start(transport.clone(), "dev-1".to_string());
        assert!(second > first);
        tokio::time::sleep(Duration::from_millis(1)).await;
        // Only the live run probes
        assert_eq!(transport.sent_of_type("heartbeat").len(), 1);
    }
}
