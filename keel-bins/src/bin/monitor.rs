//! Keel connection monitor
//!
//! Connects to a backend with a static token, keeps the connection alive
//! through the supervisor, and logs every supervisor event until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use keel_bins::common::{init_logging, print_stats, CommonArgs};
use keel_core::interfaces::{InMemoryIdentity, StaticTokenAuth};
use keel_core::{
    ConnectionMetrics, ConnectionOrchestrator, DesiredStatePatch, DisconnectReason,
    SupervisorEvent, WebSocketTransportFactory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Supervise a live backend connection")]
struct MonitorArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Keep the auxiliary service running
    #[arg(long)]
    aux: bool,

    /// Seconds between statistics reports (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,
}

fn log_event(event: &SupervisorEvent) {
    match event {
        SupervisorEvent::StatusChanged { from, to } => {
            tracing::info!("Status {} -> {}", from, to)
        }
        SupervisorEvent::QualityChanged(quality) => {
            tracing::info!("Connection quality: {}", quality.as_str())
        }
        SupervisorEvent::Message { kind, payload } => {
            tracing::info!(kind = %kind, "Message: {}", payload)
        }
        SupervisorEvent::IdentityInvalidated => {
            tracing::error!("Device identity invalidated; restart with a fresh token")
        }
        SupervisorEvent::Notice(notification) => {
            tracing::debug!("Notice: {}", notification.format())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = MonitorArgs::parse();
    let config = args.common.load_config()?;
    init_logging(&config);

    tracing::info!("=== Keel: Connection Monitor ===");
    tracing::info!("Endpoint: {}", config.transport.url);

    let token = args.common.access_token()?;
    let identity = match &args.common.device_id {
        Some(id) => InMemoryIdentity::new(id.clone()),
        None => InMemoryIdentity::generate(),
    };
    let metrics = ConnectionMetrics::new()?;

    let factory = Arc::new(WebSocketTransportFactory::new(config.transport.clone()));
    let auth = Arc::new(StaticTokenAuth::new(token));
    let orchestrator = ConnectionOrchestrator::builder(config, factory, auth)
        .identity(Arc::new(identity))
        .metrics(metrics.clone())
        .build();

    let mut events = orchestrator.subscribe();
    orchestrator
        .set_desired_state(DesiredStatePatch {
            connected: Some(true),
            aux_service_running: Some(args.aux),
        })
        .await;

    let stats_enabled = args.stats_interval > 0;
    let mut stats_tick = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    stats_tick.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = stats_tick.tick(), if stats_enabled => {
                print_stats(&orchestrator.stats(), &orchestrator.snapshot());
            }
        }
    }

    orchestrator.disconnect(DisconnectReason::UserRequested).await;
    let stats = orchestrator.stats();
    let snapshot = orchestrator.snapshot();
    orchestrator.dispose().await;

    print_stats(&stats, &snapshot);
    tracing::info!(
        "Heartbeat latency samples: {}",
        metrics.heartbeat_latency_ms.get_sample_count()
    );
    Ok(())
}
