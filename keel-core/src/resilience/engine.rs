//! Failure counting and reconnect scheduling
//!
//! # State Diagram
//!
//! ```text
//!                 attempt_reconnection()
//!      STABLE ──────────────────────────→ RECOVERING ──┐
//!        ▲  ▲                               │   ▲      │ attempt failed,
//!        │  │         reconnect succeeded   │   └──────┘ attempts left
//!        │  └───────────────────────────────┘
//!        │                                  │ attempts exhausted
//!        │ suspension timer                 ▼
//!        │                               FAILED ──reset()──→ STABLE
//!        │
//!    SUSPENDED ◄── failure_count >= failure_threshold (from any state)
//! ```
//!
//! The engine never touches a transport. It is handed a reconnect callback,
//! waits out the backoff delay on a tokio task, and re-checks disposal, auth,
//! state and its timer generation before invoking the callback. Timers are
//! aborted on exit from the state that armed them, and every timer task
//! compares its generation so a late wake-up after `reset()` or `dispose()`
//! does nothing.

use super::backoff::ExponentialBackoff;
use crate::config::ResilienceConfig;
use crate::core::{FailureKind, SupervisorError};
use crate::interfaces::AuthProvider;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Future returned by a reconnect callback
pub type ReconnectFuture = BoxFuture<'static, Result<(), SupervisorError>>;

/// Callback invoked when a scheduled reconnect fires
pub type ReconnectFn = Arc<dyn Fn() -> ReconnectFuture + Send + Sync>;

/// Resilience state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResilienceState {
    #[default]
    Stable,
    Recovering,
    Suspended,
    Failed,
}

impl ResilienceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "STABLE",
            Self::Recovering => "RECOVERING",
            Self::Suspended => "SUSPENDED",
            Self::Failed => "FAILED",
        }
    }

    /// SUSPENDED and FAILED forbid new attempts until reset
    pub fn forbids_attempts(&self) -> bool {
        matches!(self, Self::Suspended | Self::Failed)
    }
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    pub at: SystemTime,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: SystemTime::now(),
        }
    }

    /// Classify a supervisor error; `None` for errors that are not faults
    pub fn from_error(error: &SupervisorError) -> Option<Self> {
        error
            .failure_kind()
            .map(|kind| Self::new(kind, error.to_string()))
    }
}

/// Everything the engine announces
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    StateChanged {
        from: ResilienceState,
        to: ResilienceState,
    },
    Failure {
        info: FailureInfo,
        failure_count: u32,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectAttempt {
        attempt: u32,
    },
    ReconnectSuccess {
        attempt: u32,
    },
    ReconnectFailed {
        attempt: u32,
        error: String,
    },
    Suspended {
        resume_at: SystemTime,
        failure_count: u32,
    },
    Resumed,
    Failed {
        attempts: u32,
    },
    /// Recovery stopped without counting a failure (auth lapsed, no token)
    Abandoned {
        attempt: u32,
        reason: String,
    },
    Reset,
}

/// Statistics for reconnection
#[derive(Debug, Clone, Default)]
pub struct ReconnectionStats {
    /// Total number of scheduled reconnection attempts
    pub reconnection_attempts: u64,
    /// Successful reconnections
    pub successful_reconnections: u64,
    /// Failed reconnections
    pub failed_reconnections: u64,
    /// Number of times attempts were suspended
    pub suspensions: u64,
    /// Last successful reconnection
    pub last_reconnection: Option<Instant>,
}

struct EngineState {
    state: ResilienceState,
    failure_count: u32,
    backoff: ExponentialBackoff,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_in_flight: bool,
    reconnect_generation: u64,
    suspension_timer: Option<JoinHandle<()>>,
    suspension_generation: u64,
    suspended_until: Option<SystemTime>,
    last_failure: Option<FailureInfo>,
    stats: ReconnectionStats,
}

struct EngineShared {
    config: ResilienceConfig,
    auth: Arc<dyn AuthProvider>,
    disposed: AtomicBool,
    state: Mutex<EngineState>,
    events: broadcast::Sender<ResilienceEvent>,
}

/// Failure/backoff state machine
#[derive(Clone)]
pub struct ResilienceEngine {
    shared: Arc<EngineShared>,
}

impl ResilienceEngine {
    pub fn new(config: ResilienceConfig, auth: Arc<dyn AuthProvider>) -> Self {
        info!(
            max_attempts = config.max_attempts,
            failure_threshold = config.failure_threshold,
            suspension_timeout = ?config.suspension_timeout,
            "Creating resilience engine"
        );

        let backoff =
            ExponentialBackoff::with_config(config.backoff.clone(), Some(config.max_attempts));
        let (events, _) = broadcast::channel(256);

        Self {
            shared: Arc::new(EngineShared {
                config,
                auth,
                disposed: AtomicBool::new(false),
                state: Mutex::new(EngineState {
                    state: ResilienceState::Stable,
                    failure_count: 0,
                    backoff,
                    reconnect_timer: None,
                    reconnect_in_flight: false,
                    reconnect_generation: 0,
                    suspension_timer: None,
                    suspension_generation: 0,
                    suspended_until: None,
                    last_failure: None,
                    stats: ReconnectionStats::default(),
                }),
                events,
            }),
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ResilienceState {
        self.shared.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.state.lock().failure_count
    }

    /// Attempts scheduled since the last success or reset
    pub fn attempt(&self) -> u32 {
        self.shared.state.lock().backoff.attempt_number()
    }

    /// A delayed attempt is armed or its callback is running
    pub fn is_reconnect_pending(&self) -> bool {
        let st = self.shared.state.lock();
        st.reconnect_timer.is_some() || st.reconnect_in_flight
    }

    /// Whether a new attempt could be scheduled right now
    pub fn can_attempt(&self) -> bool {
        !self.is_disposed() && !self.state().forbids_attempts()
    }

    pub fn suspended_until(&self) -> Option<SystemTime> {
        self.shared.state.lock().suspended_until
    }

    pub fn last_failure(&self) -> Option<FailureInfo> {
        self.shared.state.lock().last_failure.clone()
    }

    pub fn stats(&self) -> ReconnectionStats {
        self.shared.state.lock().stats.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Record a failure; may suspend further attempts
    pub fn record_failure(&self, info: FailureInfo) {
        self.shared.record_failure(info);
    }

    /// Schedule a reconnect through `connect`
    ///
    /// Returns false when disposed, unauthenticated, SUSPENDED/FAILED, or when
    /// attempts are exhausted (which moves the engine to FAILED). Returns true
    /// once an attempt is scheduled, or if one is already pending.
    pub fn attempt_reconnection(&self, connect: ReconnectFn) -> bool {
        EngineShared::attempt_reconnection(&self.shared, connect)
    }

    /// A connection succeeded outside the reconnect path; clear bookkeeping
    pub fn record_success(&self) {
        if self.is_disposed() {
            return;
        }
        let shared = &self.shared;
        let mut st = shared.state.lock();
        if st.state == ResilienceState::Stable && st.failure_count == 0 {
            st.backoff.reset();
            return;
        }
        shared.cancel_timers(&mut st);
        st.failure_count = 0;
        st.backoff.reset();
        st.suspended_until = None;
        shared.transition(&mut st, ResilienceState::Stable);
    }

    /// Manual reset: cancel all timers, zero both counters, back to STABLE
    pub fn reset(&self) {
        if self.is_disposed() {
            return;
        }
        let shared = &self.shared;
        let mut st = shared.state.lock();
        shared.cancel_timers(&mut st);
        st.failure_count = 0;
        st.backoff.reset();
        st.suspended_until = None;
        shared.transition(&mut st, ResilienceState::Stable);
        info!("Resilience engine reset");
        shared.emit(ResilienceEvent::Reset);
    }

    /// Cancel everything; later calls are no-ops
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut st = self.shared.state.lock();
        self.shared.cancel_timers(&mut st);
        debug!("Resilience engine disposed");
    }
}

impl EngineShared {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn emit(&self, event: ResilienceEvent) {
        if self.is_disposed() {
            return;
        }
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, st: &mut EngineState, to: ResilienceState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        info!("Resilience state {} -> {}", from.as_str(), to.as_str());
        self.emit(ResilienceEvent::StateChanged { from, to });
    }

    fn cancel_timers(&self, st: &mut EngineState) {
        if let Some(timer) = st.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(timer) = st.suspension_timer.take() {
            timer.abort();
        }
        st.reconnect_generation += 1;
        st.suspension_generation += 1;
        st.reconnect_in_flight = false;
    }

    fn record_failure(self: &Arc<Self>, info: FailureInfo) {
        if self.is_disposed() {
            return;
        }

        let mut st = self.state.lock();
        if st.state.forbids_attempts() {
            debug!(
                "Ignoring {} failure while {}",
                info.kind.as_str(),
                st.state.as_str()
            );
            return;
        }

        st.failure_count += 1;
        st.last_failure = Some(info.clone());
        let failure_count = st.failure_count;
        warn!(
            kind = info.kind.as_str(),
            failure_count,
            threshold = self.config.failure_threshold,
            "Connection failure recorded: {}",
            info.message
        );
        self.emit(ResilienceEvent::Failure {
            info,
            failure_count,
        });

        if failure_count >= self.config.failure_threshold {
            self.suspend(&mut st);
        }
    }

    fn suspend(self: &Arc<Self>, st: &mut EngineState) {
        self.cancel_timers(st);

        let timeout = self.config.suspension_timeout;
        let resume_at = SystemTime::now() + timeout;
        st.suspended_until = Some(resume_at);
        st.stats.suspensions += 1;
        self.transition(st, ResilienceState::Suspended);

        let generation = st.suspension_generation;
        let shared = Arc::clone(self);
        st.suspension_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.resume_after_suspension(generation);
        }));

        warn!(
            failure_count = st.failure_count,
            "Reconnect attempts suspended for {:?}", timeout
        );
        self.emit(ResilienceEvent::Suspended {
            resume_at,
            failure_count: st.failure_count,
        });
    }

    fn resume_after_suspension(&self, generation: u64) {
        if self.is_disposed() {
            return;
        }
        let mut st = self.state.lock();
        if st.suspension_generation != generation || st.state != ResilienceState::Suspended {
            return;
        }
        st.suspension_timer = None;
        st.suspended_until = None;
        st.failure_count = 0;
        st.backoff.reset();
        self.transition(&mut st, ResilienceState::Stable);
        info!("Suspension expired, reconnect attempts resumed");
        self.emit(ResilienceEvent::Resumed);
    }

    fn attempt_reconnection(self: &Arc<Self>, connect: ReconnectFn) -> bool {
        if self.is_disposed() {
            return false;
        }
        if !self.auth.is_authenticated() {
            debug!("Reconnect not attempted: not authenticated");
            return false;
        }

        let mut st = self.state.lock();
        if st.state.forbids_attempts() {
            debug!("Reconnect not attempted: engine {}", st.state.as_str());
            return false;
        }
        if st.reconnect_timer.is_some() || st.reconnect_in_flight {
            debug!("Reconnect already scheduled");
            return true;
        }
        if st.failure_count >= self.config.failure_threshold {
            return false;
        }

        let Some(delay) = st.backoff.next_delay() else {
            let attempts = st.backoff.attempt_number();
            self.cancel_timers(&mut st);
            self.transition(&mut st, ResilienceState::Failed);
            warn!("Reconnect attempts exhausted after {} attempts", attempts);
            self.emit(ResilienceEvent::Failed { attempts });
            return false;
        };
        let attempt = st.backoff.attempt_number();

        self.transition(&mut st, ResilienceState::Recovering);
        st.stats.reconnection_attempts += 1;
        st.reconnect_generation += 1;
        let generation = st.reconnect_generation;

        info!(
            attempt,
            max_attempts = self.config.max_attempts,
            "Reconnect scheduled in {:?}", delay
        );
        self.emit(ResilienceEvent::ReconnectScheduled { attempt, delay });

        let shared = Arc::clone(self);
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.run_scheduled(generation, attempt, connect).await;
        }));

        true
    }

    /// Leave RECOVERING without a timer; the owner decides what comes next
    fn abandon(&self, st: &mut EngineState, attempt: u32, reason: String) {
        self.cancel_timers(st);
        st.backoff.reset();
        self.transition(st, ResilienceState::Stable);
        info!(attempt, "Recovery abandoned: {}", reason);
        self.emit(ResilienceEvent::Abandoned { attempt, reason });
    }

    async fn run_scheduled(self: Arc<Self>, generation: u64, attempt: u32, connect: ReconnectFn) {
        {
            let mut st = self.state.lock();
            if self.is_disposed()
                || st.reconnect_generation != generation
                || st.state != ResilienceState::Recovering
            {
                return;
            }
            st.reconnect_timer = None;
            // Time has passed since scheduling
            if !self.auth.is_authenticated() {
                debug!("Scheduled reconnect skipped: no longer authenticated");
                self.abandon(&mut st, attempt, "not authenticated".to_string());
                return;
            }
            st.reconnect_in_flight = true;
            debug!(attempt, "Executing reconnect attempt");
            self.emit(ResilienceEvent::ReconnectAttempt { attempt });
        }

        let result = connect().await;

        let error = {
            let mut st = self.state.lock();
            if self.is_disposed() || st.reconnect_generation != generation {
                // Reset, suspension or disposal happened while we were connecting
                return;
            }
            st.reconnect_in_flight = false;

            match result {
                Ok(()) => {
                    st.stats.successful_reconnections += 1;
                    st.stats.last_reconnection = Some(Instant::now());
                    st.failure_count = 0;
                    st.backoff.reset();
                    self.transition(&mut st, ResilienceState::Stable);
                    info!(attempt, "Reconnect succeeded");
                    self.emit(ResilienceEvent::ReconnectSuccess { attempt });
                    return;
                }
                Err(e) => {
                    st.stats.failed_reconnections += 1;
                    warn!(attempt, "Reconnect attempt failed: {}", e);
                    self.emit(ResilienceEvent::ReconnectFailed {
                        attempt,
                        error: e.to_string(),
                    });
                    e
                }
            }
        };

        let Some(info) = FailureInfo::from_error(&error) else {
            let mut st = self.state.lock();
            if st.reconnect_generation == generation {
                self.abandon(&mut st, attempt, error.to_string());
            }
            return;
        };
        self.record_failure(info);

        let still_recovering = self.state.lock().state == ResilienceState::Recovering;
        if still_recovering {
            Self::attempt_reconnection(&self, connect);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransportError;
    use crate::resilience::BackoffConfig;
    use crate::testing::MockAuth;
    use futures::FutureExt;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;

    fn test_config(max_attempts: u32, failure_threshold: u32) -> ResilienceConfig {
        ResilienceConfig {
            backoff: BackoffConfig::fixed_growth(Duration::from_millis(100), Duration::from_secs(5)),
            max_attempts,
            failure_threshold,
            suspension_timeout: Duration::from_secs(60),
        }
    }

    fn failing_connect(calls: Arc<AtomicU32>) -> ReconnectFn {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SupervisorError::Transport(TransportError::ConnectFailed(
                    "refused".into(),
                )))
            }
            .boxed()
        })
    }

    fn ok_connect(calls: Arc<AtomicU32>) -> ReconnectFn {
        Arc::new(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        })
    }

    #[test]
    fn test_initial_state() {
        let engine = ResilienceEngine::new(test_config(3, 5), Arc::new(MockAuth::authenticated()));
        assert_eq!(engine.state(), ResilienceState::Stable);
        assert_eq!(engine.failure_count(), 0);
        assert_eq!(engine.attempt(), 0);
        assert!(engine.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_attempt_rejected() {
        let engine = ResilienceEngine::new(test_config(3, 5), Arc::new(MockAuth::signed_out()));
        let calls = Arc::new(AtomicU32::new(0));
        assert!(!engine.attempt_reconnection(ok_connect(calls.clone())));
        assert_eq!(engine.state(), ResilienceState::Stable);
        assert_eq!(engine.attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_does_not_stack() {
        let engine = ResilienceEngine::new(test_config(5, 5), Arc::new(MockAuth::authenticated()));
        let calls = Arc::new(AtomicU32::new(0));

        assert!(engine.attempt_reconnection(ok_connect(calls.clone())));
        assert!(engine.attempt_reconnection(ok_connect(calls.clone())));
        assert_eq!(engine.attempt(), 1);
        assert_eq!(engine.state(), ResilienceState::Recovering);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state(), ResilienceState::Stable);
        assert_eq!(engine.attempt(), 0);
        assert_eq!(engine.stats().successful_reconnections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_rearms_with_backoff() {
        let engine = ResilienceEngine::new(test_config(5, 10), Arc::new(MockAuth::authenticated()));
        let mut events = engine.subscribe();
        let calls = Arc::new(AtomicU32::new(0));

        assert!(engine.attempt_reconnection(failing_connect(calls.clone())));
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.failure_count(), 1);
        assert_eq!(engine.attempt(), 2);

        // Second delay is 200ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let mut scheduled = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ResilienceEvent::ReconnectScheduled { attempt, delay } = event {
                scheduled.push((attempt, delay));
            }
        }
        assert_eq!(scheduled[0], (1, Duration::from_millis(100)));
        assert_eq!(scheduled[1], (2, Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_timer() {
        let engine = ResilienceEngine::new(test_config(5, 5), Arc::new(MockAuth::authenticated()));
        let calls = Arc::new(AtomicU32::new(0));

        assert!(engine.attempt_reconnection(ok_connect(calls.clone())));
        engine.reset();
        assert!(!engine.is_reconnect_pending());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state(), ResilienceState::Stable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspension_expires_back_to_stable() {
        let engine = ResilienceEngine::new(test_config(5, 2), Arc::new(MockAuth::authenticated()));
        let mut events = engine.subscribe();

        engine.record_failure(FailureInfo::new(FailureKind::Transport, "one"));
        engine.record_failure(FailureInfo::new(FailureKind::Transport, "two"));
        assert_eq!(engine.state(), ResilienceState::Suspended);
        assert!(!engine.can_attempt());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(engine.state(), ResilienceState::Stable);
        assert_eq!(engine.failure_count(), 0);

        let mut resumed = false;
        while let Ok(event) = events.try_recv() {
            if event == ResilienceEvent::Resumed {
                resumed = true;
            }
        }
        assert!(resumed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_silences_timers() {
        let engine = ResilienceEngine::new(test_config(5, 5), Arc::new(MockAuth::authenticated()));
        let mut events = engine.subscribe();
        let calls = Arc::new(AtomicU32::new(0));

        assert!(engine.attempt_reconnection(ok_connect(calls.clone())));
        while events.try_recv().is_ok() {}

        engine.dispose();
        engine.dispose();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!engine.attempt_reconnection(ok_connect(calls.clone())));
        engine.record_failure(FailureInfo::new(FailureKind::Transport, "late"));
        engine.reset();
        assert!(events.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn prop_threshold_failures_always_suspend(
            failure_threshold in 1u32..20,
            extra_failures in 0u32..10,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let _guard = rt.enter();

            let engine = ResilienceEngine::new(
                test_config(5, failure_threshold),
                Arc::new(MockAuth::authenticated()),
            );
            for i in 0..failure_threshold {
                prop_assert_eq!(engine.state(), ResilienceState::Stable);
                engine.record_failure(FailureInfo::new(FailureKind::Transport, format!("drop {}", i)));
            }
            prop_assert_eq!(engine.state(), ResilienceState::Suspended);

            for _ in 0..extra_failures {
                engine.record_failure(FailureInfo::new(FailureKind::Liveness, "late"));
            }
            prop_assert_eq!(engine.state(), ResilienceState::Suspended);
            prop_assert_eq!(engine.failure_count(), failure_threshold);
            prop_assert_eq!(engine.stats().suspensions, 1);
            engine.dispose();
        }
    }
}
