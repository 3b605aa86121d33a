//! Resilience engine driven through its public API

use futures::FutureExt;
use keel_core::config::ResilienceConfig;
use keel_core::resilience::{FailureInfo, ReconnectFn};
use keel_core::testing::MockAuth;
use keel_core::{
    BackoffConfig, FailureKind, ResilienceEngine, ResilienceEvent, ResilienceState,
    SupervisorError, TransportError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn config(max_attempts: u32, failure_threshold: u32) -> ResilienceConfig {
    ResilienceConfig {
        backoff: BackoffConfig::fixed_growth(Duration::from_millis(100), Duration::from_secs(5)),
        max_attempts,
        failure_threshold,
        suspension_timeout: Duration::from_secs(300),
    }
}

fn refusing(calls: Arc<AtomicU32>) -> ReconnectFn {
    Arc::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            Err(SupervisorError::Transport(TransportError::ConnectFailed(
                "connection refused".into(),
            )))
        }
        .boxed()
    })
}

fn events_of(rx: &mut tokio::sync::broadcast::Receiver<ResilienceEvent>) -> Vec<ResilienceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_threshold_failures_suspend_once() {
    let engine = ResilienceEngine::new(config(10, 3), Arc::new(MockAuth::authenticated()));
    let mut rx = engine.subscribe();

    for i in 0..3 {
        engine.record_failure(FailureInfo::new(FailureKind::Transport, format!("drop {}", i)));
    }
    assert_eq!(engine.state(), ResilienceState::Suspended);
    assert_eq!(engine.failure_count(), 3);

    let resume_at = engine.suspended_until().unwrap();
    let remaining = resume_at.duration_since(SystemTime::now()).unwrap();
    assert!(remaining <= Duration::from_secs(300));
    assert!(remaining >= Duration::from_secs(299));

    // Further failures while suspended are not counted
    engine.record_failure(FailureInfo::new(FailureKind::Liveness, "late"));
    assert_eq!(engine.failure_count(), 3);

    let suspended: Vec<_> = events_of(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ResilienceEvent::Suspended { .. }))
        .collect();
    assert_eq!(suspended.len(), 1);
    match &suspended[0] {
        ResilienceEvent::Suspended {
            resume_at: announced,
            failure_count,
        } => {
            assert_eq!(*announced, resume_at);
            assert_eq!(*failure_count, 3);
        }
        other => panic!("unexpected {:?}", other),
    }

    let calls = Arc::new(AtomicU32::new(0));
    assert!(!engine.attempt_reconnection(refusing(calls.clone())));
    assert_eq!(engine.stats().suspensions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_attempts_move_to_failed() {
    let engine = ResilienceEngine::new(config(2, 10), Arc::new(MockAuth::authenticated()));
    let mut rx = engine.subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    assert!(engine.attempt_reconnection(refusing(calls.clone())));
    assert_eq!(engine.state(), ResilienceState::Recovering);

    // Attempt 1 after 100ms, attempt 2 after a further 200ms
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.state(), ResilienceState::Failed);
    assert_eq!(engine.stats().failed_reconnections, 2);

    assert!(!engine.attempt_reconnection(refusing(calls.clone())));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let failed: Vec<_> = events_of(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ResilienceEvent::Failed { .. }))
        .collect();
    assert_eq!(failed, vec![ResilienceEvent::Failed { attempts: 2 }]);

    // Only a reset allows attempts again
    engine.reset();
    assert_eq!(engine.state(), ResilienceState::Stable);
    assert!(engine.attempt_reconnection(refusing(calls)));
}

#[tokio::test(start_paused = true)]
async fn test_success_clears_counters() {
    let engine = ResilienceEngine::new(config(5, 5), Arc::new(MockAuth::authenticated()));

    engine.record_failure(FailureInfo::new(FailureKind::Handshake, "bad session"));
    engine.record_failure(FailureInfo::new(FailureKind::Transport, "refused"));
    assert_eq!(engine.failure_count(), 2);
    assert_eq!(
        engine.last_failure().map(|f| f.kind),
        Some(FailureKind::Transport)
    );

    engine.record_success();
    assert_eq!(engine.failure_count(), 0);
    assert_eq!(engine.attempt(), 0);
    assert_eq!(engine.state(), ResilienceState::Stable);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_before_fire_skips_attempt() {
    let auth = Arc::new(MockAuth::authenticated());
    let engine = ResilienceEngine::new(config(5, 5), auth.clone());
    let calls = Arc::new(AtomicU32::new(0));

    assert!(engine.attempt_reconnection(refusing(calls.clone())));
    auth.sign_out();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!engine.is_reconnect_pending());
    assert_eq!(engine.state(), ResilienceState::Stable);
    assert_eq!(engine.attempt(), 0);
    assert_eq!(engine.failure_count(), 0);

    // Not stranded: signing back in allows a fresh attempt
    auth.refresh();
    assert!(engine.attempt_reconnection(refusing(calls)));
}

#[tokio::test(start_paused = true)]
async fn test_uncounted_reconnect_error_abandons_recovery() {
    let engine = ResilienceEngine::new(config(5, 3), Arc::new(MockAuth::authenticated()));
    let mut rx = engine.subscribe();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let no_token: ReconnectFn = Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(SupervisorError::AuthRequired) }.boxed()
    });

    engine.record_failure(FailureInfo::new(FailureKind::Transport, "socket dropped"));
    assert!(engine.attempt_reconnection(no_token));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.failure_count(), 1);
    assert_eq!(engine.state(), ResilienceState::Stable);
    assert!(!engine.is_reconnect_pending());
    assert_eq!(
        engine.last_failure().map(|f| f.kind),
        Some(FailureKind::Transport)
    );

    let abandoned: Vec<_> = events_of(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, ResilienceEvent::Abandoned { .. }))
        .collect();
    assert_eq!(
        abandoned,
        vec![ResilienceEvent::Abandoned {
            attempt: 1,
            reason: SupervisorError::AuthRequired.to_string(),
        }]
    );
}
