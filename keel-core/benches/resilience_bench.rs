// Resilience Benchmarks
//
// Reconnect scheduling sits on the failure path, so it only needs to stay
// cheap relative to a network round trip:
// - Backoff delay computation (jittered and deterministic)
// - Backoff sequence advance/reset
// - Wire envelope parsing for the frames the supervisor routes

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use keel_core::protocol::ServerMessage;
use keel_core::resilience::ExponentialBackoff;
use keel_core::BackoffConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

// ============================================================================
// BACKOFF BENCHMARKS
// ============================================================================

fn bench_backoff_delay(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay");
    group.measurement_time(Duration::from_secs(2));

    let jittered = BackoffConfig::default();
    let fixed = BackoffConfig::fixed_growth(Duration::from_millis(100), Duration::from_secs(30));

    for attempt in [1u32, 5, 10, 64] {
        group.bench_with_input(
            BenchmarkId::new("jittered", attempt),
            &attempt,
            |b, &attempt| {
                let mut rng = StdRng::seed_from_u64(7);
                b.iter(|| black_box(jittered.delay_for_attempt(black_box(attempt), &mut rng)))
            },
        );
        group.bench_with_input(
            BenchmarkId::new("deterministic", attempt),
            &attempt,
            |b, &attempt| {
                let mut rng = StdRng::seed_from_u64(7);
                b.iter(|| black_box(fixed.delay_for_attempt(black_box(attempt), &mut rng)))
            },
        );
    }

    group.finish();
}

fn bench_backoff_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_sequence");
    group.measurement_time(Duration::from_secs(2));

    group.bench_function("ten_attempts_then_reset", |b| {
        let mut backoff = ExponentialBackoff::with_config(BackoffConfig::default(), Some(10));
        b.iter(|| {
            while let Some(delay) = backoff.next_delay() {
                black_box(delay);
            }
            backoff.reset();
        })
    });

    group.finish();
}

// ============================================================================
// ENVELOPE PARSING BENCHMARKS
// ============================================================================

fn bench_envelope_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_parse");
    group.measurement_time(Duration::from_secs(2));

    let ack = r#"{"type":"heartbeat_ack","clientTimestamp":1700000000000,"identityValid":true}"#;
    let session = r#"{"type":"session_info","requestId":"5f0c","deviceId":"dev-1","expiresAt":1700003600000,"auxStatus":"running"}"#;
    let business = r#"{"type":"order_update","orderId":42,"status":"filled","price":"101.25"}"#;

    group.bench_function("heartbeat_ack", |b| {
        b.iter(|| black_box(ServerMessage::parse(black_box(ack))))
    });
    group.bench_function("session_response", |b| {
        b.iter(|| black_box(ServerMessage::parse(black_box(session))))
    });
    group.bench_function("business_payload", |b| {
        b.iter(|| black_box(ServerMessage::parse(black_box(business))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_backoff_delay,
    bench_backoff_sequence,
    bench_envelope_parse
);
criterion_main!(benches);
