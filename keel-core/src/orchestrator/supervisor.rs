//! Supervisor internals
//!
//! All asynchronous inputs (transport events tagged with their
//! [`TransportId`], heartbeat events, resilience events, auth events) are
//! consumed by one event loop task. Handlers never await; anything that needs
//! the network is spawned and re-checks disposal and transport identity at
//! every resumption point.
//!
//! State lives behind a `parking_lot::Mutex` that is never held across an
//! `.await`. Every mutation goes through [`Supervisor::update`], which
//! publishes a snapshot to the state sink when something visible changed.

use super::events::{SupervisorEvent, SupervisorStats};
use crate::config::SupervisorConfig;
use crate::core::{
    AuxStatus, ConnectionQuality, ConnectionSnapshot, DesiredState, DesiredStatePatch,
    DisconnectReason, FailureKind, ObservedStatus, SessionHandle, SupervisorError,
    TransportError, TransportId,
};
use crate::heartbeat::{HeartbeatEvent, HeartbeatEventKind, HeartbeatMonitor};
use crate::interfaces::{AuthEvent, AuthProvider, DeviceIdentity, StateSink};
use crate::monitoring::{ConnectionMetrics, Notification, Notifier};
use crate::protocol::ServerMessage;
use crate::resilience::{
    FailureInfo, ReconnectFn, ResilienceEngine, ResilienceEvent, ResilienceState,
};
use crate::session::SessionClient;
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportFactory};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// The one transport the supervisor currently owns
pub(super) struct ActiveTransport {
    id: TransportId,
    handle: Arc<dyn Transport>,
    device_id: String,
    /// Forwards this transport's events into the loop; aborting it detaches
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct SupervisorState {
    desired: DesiredState,
    status: ObservedStatus,
    quality: ConnectionQuality,
    aux_status: AuxStatus,
    last_error: Option<String>,
    transport: Option<ActiveTransport>,
    transports_created: u64,
    session: Option<SessionHandle>,
    /// Set by identity invalidation, cleared only by fresh authentication
    identity_blocked: bool,
    /// Reconciliation requested before auth initialized
    reconcile_deferred: bool,
    aux_in_flight: bool,
    connected_since: Option<Instant>,
}

/// Collaborators handed over by the builder
pub(super) struct SupervisorParts {
    pub config: SupervisorConfig,
    pub factory: Arc<dyn TransportFactory>,
    pub auth: Arc<dyn AuthProvider>,
    pub identity: Arc<dyn DeviceIdentity>,
    pub sink: Arc<dyn StateSink>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Option<ConnectionMetrics>,
}

type TransportEnvelope = (TransportId, TransportEvent);

pub(super) struct Supervisor {
    config: SupervisorConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthProvider>,
    identity: Arc<dyn DeviceIdentity>,
    sink: Arc<dyn StateSink>,
    notifier: Arc<dyn Notifier>,
    metrics: Option<ConnectionMetrics>,
    pub(super) engine: ResilienceEngine,
    pub(super) heartbeat: HeartbeatMonitor,
    session: SessionClient,
    disposed: AtomicBool,
    state: Mutex<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
    transport_events: mpsc::UnboundedSender<TransportEnvelope>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Build the supervisor and spawn its event loop (requires a tokio runtime)
    pub(super) fn start(parts: SupervisorParts) -> Arc<Self> {
        let SupervisorParts {
            config,
            factory,
            auth,
            identity,
            sink,
            notifier,
            metrics,
        } = parts;

        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let engine = ResilienceEngine::new(config.resilience.clone(), Arc::clone(&auth));
        let resilience_rx = engine.subscribe();
        let auth_rx = auth.subscribe();
        let (events, _) = broadcast::channel(256);

        let supervisor = Arc::new(Self {
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone(), heartbeat_tx),
            session: SessionClient::new(config.session.clone()),
            config,
            factory,
            auth,
            identity,
            sink,
            notifier,
            metrics,
            engine,
            disposed: AtomicBool::new(false),
            state: Mutex::new(SupervisorState::default()),
            events,
            transport_events: transport_tx,
            event_loop: Mutex::new(None),
        });

        let handle = tokio::spawn(run_event_loop(
            Arc::clone(&supervisor),
            transport_rx,
            heartbeat_rx,
            resilience_rx,
            auth_rx,
        ));
        *supervisor.event_loop.lock() = Some(handle);

        info!(url = %supervisor.config.transport.url, "Connection supervisor started");
        supervisor
    }

    pub(super) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SupervisorEvent) {
        if self.is_disposed() {
            return;
        }
        let _ = self.events.send(event);
    }

    fn notify(&self, notification: Notification) {
        if self.is_disposed() {
            return;
        }
        self.emit(SupervisorEvent::Notice(notification.clone()));
        self.notifier.notify(notification);
    }

    // ------------------------------------------------------------------
    // State and snapshots
    // ------------------------------------------------------------------

    fn snapshot_of(&self, st: &SupervisorState) -> ConnectionSnapshot {
        ConnectionSnapshot {
            observed_status: st.status,
            connection_quality: st.quality,
            is_recovering: st.status == ObservedStatus::Recovering,
            recovery_attempt: self.engine.attempt(),
            aux_status: st.aux_status,
            last_error: st.last_error.clone(),
        }
    }

    pub(super) fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_of(&self.state.lock())
    }

    pub(super) fn status(&self) -> ObservedStatus {
        self.state.lock().status
    }

    pub(super) fn desired_state(&self) -> DesiredState {
        self.state.lock().desired
    }

    pub(super) fn session_handle(&self) -> Option<SessionHandle> {
        self.state.lock().session.clone()
    }

    pub(super) fn stats(&self) -> SupervisorStats {
        let (uptime, transports_created) = {
            let st = self.state.lock();
            (st.connected_since.map(|at| at.elapsed()), st.transports_created)
        };
        SupervisorStats {
            reconnection: self.engine.stats(),
            resilience_state: self.engine.state(),
            failure_count: self.engine.failure_count(),
            uptime,
            transports_created,
        }
    }

    /// Mutate state, then publish outside the lock if the snapshot changed
    fn update<R>(&self, mutate: impl FnOnce(&mut SupervisorState) -> R) -> R {
        let (result, before, after) = {
            let mut st = self.state.lock();
            let before = self.snapshot_of(&st);
            let result = mutate(&mut st);
            let after = self.snapshot_of(&st);
            (result, before, after)
        };
        if before != after {
            self.publish(&before, &after);
        }
        result
    }

    fn publish(&self, before: &ConnectionSnapshot, after: &ConnectionSnapshot) {
        if self.is_disposed() {
            return;
        }
        self.sink.publish(after);
        if let Some(metrics) = &self.metrics {
            metrics.set_status(after.observed_status);
        }
        if before.observed_status != after.observed_status {
            info!(
                "Connection status {} -> {}",
                before.observed_status, after.observed_status
            );
            self.emit(SupervisorEvent::StatusChanged {
                from: before.observed_status,
                to: after.observed_status,
            });
        }
        if before.connection_quality != after.connection_quality {
            self.emit(SupervisorEvent::QualityChanged(after.connection_quality));
        }
    }

    fn is_current(&self, id: TransportId) -> bool {
        self.state
            .lock()
            .transport
            .as_ref()
            .is_some_and(|active| active.id == id)
    }

    fn ensure_current(&self, id: TransportId) -> Result<(), SupervisorError> {
        if self.is_disposed() {
            return Err(SupervisorError::Disposed);
        }
        if !self.is_current(id) {
            return Err(SupervisorError::Superseded);
        }
        Ok(())
    }

    fn device_id(&self) -> String {
        match self.identity.device_id() {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                info!(device_id = %id, "Generated new device identity");
                self.identity.set_device_id(id.clone());
                id
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport ownership
    // ------------------------------------------------------------------

    /// Create a transport and make it current, retiring the previous one
    fn install_transport(
        &self,
        device_id: &str,
    ) -> Result<(TransportId, Arc<dyn Transport>), SupervisorError> {
        let handle = self.factory.create();
        let events = handle.take_events().ok_or_else(|| {
            TransportError::InvalidRequest("transport events already taken".to_string())
        })?;

        let (id, stale) = {
            let mut st = self.state.lock();
            if self.is_disposed() {
                return Err(SupervisorError::Disposed);
            }
            st.transports_created += 1;
            let id = TransportId(st.transports_created);
            let pump = tokio::spawn(pump_transport_events(
                id,
                events,
                self.transport_events.clone(),
            ));
            let stale = st.transport.replace(ActiveTransport {
                id,
                handle: Arc::clone(&handle),
                device_id: device_id.to_string(),
                pump,
            });
            (id, stale)
        };

        if let Some(stale) = stale {
            debug!(stale = %stale.id, current = %id, "Retiring superseded transport");
            self.retire(stale, "superseded");
        }
        Ok((id, handle))
    }

    /// Detach, cancel its requests, force-close in the background
    fn retire(&self, active: ActiveTransport, reason: &str) {
        active.pump.abort();
        self.session.cancel_all(reason);
        let handle = active.handle;
        let reason = reason.to_string();
        tokio::spawn(async move {
            handle.disconnect(&reason).await;
        });
    }

    /// Token, identity, fresh transport, open
    async fn open_transport(
        self: &Arc<Self>,
    ) -> Result<(TransportId, Arc<dyn Transport>, String), SupervisorError> {
        let token = self
            .auth
            .access_token()
            .await
            .ok_or(SupervisorError::AuthRequired)?;
        if self.is_disposed() {
            return Err(SupervisorError::Disposed);
        }

        let device_id = self.device_id();
        let (id, transport) = self.install_transport(&device_id)?;
        if let Some(metrics) = &self.metrics {
            metrics.connect_attempts_total.inc();
        }

        debug!(%id, "Opening transport");
        let opened = transport
            .connect(ConnectParams {
                url: self.config.transport.url.clone(),
                access_token: token,
                device_id: device_id.clone(),
            })
            .await;
        self.ensure_current(id)?;
        if !opened? {
            return Err(TransportError::Aborted("open still in progress".to_string()).into());
        }
        Ok((id, transport, device_id))
    }

    fn current_transport(&self) -> Option<(TransportId, Arc<dyn Transport>, String)> {
        self.state
            .lock()
            .transport
            .as_ref()
            .map(|active| (active.id, Arc::clone(&active.handle), active.device_id.clone()))
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub(super) async fn set_desired_state(self: &Arc<Self>, patch: DesiredStatePatch) {
        if self.is_disposed() {
            return;
        }
        let changed = self.state.lock().desired.merge(patch);
        if changed {
            debug!(desired = ?self.desired_state(), "Desired state changed");
        }
        self.reconcile().await;
    }

    /// Bring observed state in line with desired state
    async fn reconcile(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let (desired, status, has_transport) = {
            let mut st = self.state.lock();
            if !self.auth.is_initialized() {
                if !st.reconcile_deferred {
                    debug!("Auth not initialized, deferring reconciliation");
                }
                st.reconcile_deferred = true;
                return;
            }
            (st.desired, st.status, st.transport.is_some())
        };

        if desired.connected {
            match status {
                ObservedStatus::Disconnected => {
                    if !self.engine.can_attempt() || self.engine.is_reconnect_pending() {
                        debug!(
                            engine = self.engine.state().as_str(),
                            "Not connecting, resilience engine holds attempts"
                        );
                        return;
                    }
                    self.connect().await;
                }
                ObservedStatus::Connected => self.reconcile_aux().await,
                ObservedStatus::Connecting | ObservedStatus::Recovering => {}
            }
        } else if status != ObservedStatus::Disconnected
            || has_transport
            || self.engine.is_reconnect_pending()
        {
            self.disconnect(DisconnectReason::UserRequested).await;
        }
    }

    fn spawn_reconcile(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.reconcile().await });
    }

    /// Returns the best-known connected flag when the call is a no-op
    fn begin_connect(&self) -> Result<(), bool> {
        if self.is_disposed() {
            return Err(false);
        }
        if !self.auth.is_initialized() {
            debug!("Connect ignored, auth not initialized");
            return Err(false);
        }
        if !self.auth.is_authenticated() {
            debug!("Connect ignored, not authenticated");
            return Err(false);
        }
        self.update(|st| {
            if st.identity_blocked {
                debug!("Connect blocked until fresh authentication");
                return Err(false);
            }
            match st.status {
                ObservedStatus::Connected => Err(true),
                ObservedStatus::Connecting | ObservedStatus::Recovering => Err(false),
                ObservedStatus::Disconnected => {
                    st.status = ObservedStatus::Connecting;
                    Ok(())
                }
            }
        })
    }

    pub(super) async fn connect(self: &Arc<Self>) -> bool {
        if let Err(current) = self.begin_connect() {
            return current;
        }

        let (id, transport, device_id) = match self.open_transport().await {
            Ok(opened) => opened,
            Err(error) => {
                self.fail_connect(None, error);
                return false;
            }
        };

        let result = match self
            .session
            .request_session_info(transport.as_ref(), &device_id)
            .await
        {
            Ok(session) => self.mark_connected(id, session),
            Err(error) => Err(error.into()),
        };

        match result {
            Ok(()) => {
                self.engine.record_success();
                true
            }
            Err(error) => {
                self.fail_connect(Some(id), error);
                false
            }
        }
    }

    fn fail_connect(self: &Arc<Self>, id: Option<TransportId>, error: SupervisorError) {
        if self.is_disposed() || matches!(error, SupervisorError::Disposed | SupervisorError::Superseded)
        {
            debug!("Connect abandoned: {}", error);
            return;
        }
        if let Some(id) = id {
            if !self.is_current(id) {
                debug!(%id, "Connect abandoned, transport superseded");
                return;
            }
        }

        warn!("Connection attempt failed: {}", error);
        let stale = self.update(|st| {
            st.status = ObservedStatus::Disconnected;
            st.quality = ConnectionQuality::Disconnected;
            st.last_error = Some(error.to_string());
            st.transport.take()
        });
        if let Some(stale) = stale {
            self.retire(stale, "connect failed");
        }

        // Missing credentials block attempts but are not a fault
        let Some(info) = FailureInfo::from_error(&error) else {
            return;
        };
        self.engine.record_failure(info);
        self.attempt_recovery("connect failed");
    }

    /// Session validated on transport `id`: go live
    fn mark_connected(
        self: &Arc<Self>,
        id: TransportId,
        session: SessionHandle,
    ) -> Result<(), SupervisorError> {
        if self.is_disposed() {
            return Err(SupervisorError::Disposed);
        }
        let (transport, device_id, was_recovering) = self.update(|st| {
            let Some(active) = st.transport.as_ref().filter(|active| active.id == id) else {
                return Err(SupervisorError::Superseded);
            };
            let live = (
                Arc::clone(&active.handle),
                active.device_id.clone(),
                st.status == ObservedStatus::Recovering,
            );
            st.status = ObservedStatus::Connected;
            st.aux_status = session.aux_status;
            st.session = Some(session);
            st.last_error = None;
            st.connected_since = Some(Instant::now());
            Ok(live)
        })?;

        self.heartbeat.start(transport, device_id);
        if was_recovering {
            if let Some(metrics) = &self.metrics {
                metrics.reconnect_success_total.inc();
            }
            self.notify(Notification::success("Reconnected", "Connection restored"));
        }
        self.spawn_aux_reconcile();
        Ok(())
    }

    pub(super) async fn disconnect(self: &Arc<Self>, reason: DisconnectReason) {
        if self.is_disposed() {
            return;
        }

        let (active, idle) = self.update(|st| {
            let active = st.transport.take();
            let idle = active.is_none() && st.status == ObservedStatus::Disconnected;
            let was_connected = st.status == ObservedStatus::Connected;
            st.status = ObservedStatus::Disconnected;
            st.quality = ConnectionQuality::Disconnected;
            st.session = None;
            st.connected_since = None;
            (active.map(|active| (active, was_connected)), idle)
        });
        self.heartbeat.stop();

        if idle {
            if reason.will_retry() {
                trace!(reason = reason.as_str(), "Already disconnected");
                return;
            }
            if self.engine.state() == ResilienceState::Stable
                && !self.engine.is_reconnect_pending()
            {
                return;
            }
        }
        info!(reason = reason.as_str(), "Disconnecting");

        if let Some((active, was_connected)) = active {
            if was_connected && graceful_stop(reason) && active.handle.is_connected() {
                if let Err(e) = self
                    .session
                    .stop_session(active.handle.as_ref(), &active.device_id)
                    .await
                {
                    warn!("Graceful session stop failed: {}", e);
                }
            }
            active.pump.abort();
            self.session.cancel_all(reason.as_str());
            active.handle.disconnect(reason.as_str()).await;
        }

        if self.is_disposed() {
            return;
        }

        if reason.is_clean() {
            self.engine.reset();
            self.update(|_| ());
        } else {
            let info = match reason {
                DisconnectReason::LivenessTimeout => FailureInfo::new(
                    FailureKind::Liveness,
                    SupervisorError::LivenessTimeout(self.config.heartbeat.timeout).to_string(),
                ),
                DisconnectReason::SessionRevalidationFailed => FailureInfo::new(
                    FailureKind::Revalidation,
                    "session re-validation failed after reconnect",
                ),
                _ => FailureInfo::new(FailureKind::Transport, "connection dropped"),
            };
            self.engine.record_failure(info);
            self.attempt_recovery(reason.as_str());
        }
    }

    pub(super) fn attempt_recovery(self: &Arc<Self>, reason: &str) -> bool {
        if self.is_disposed() || !self.auth.is_authenticated() {
            return false;
        }
        {
            let st = self.state.lock();
            if st.identity_blocked {
                debug!("Recovery blocked, identity invalidated");
                return false;
            }
            if matches!(
                st.status,
                ObservedStatus::Connected | ObservedStatus::Connecting
            ) {
                return false;
            }
        }
        if self.engine.is_reconnect_pending() {
            return true;
        }
        if !self.engine.can_attempt() {
            debug!(
                engine = self.engine.state().as_str(),
                "Recovery not attempted"
            );
            return false;
        }

        let scheduled = self.engine.attempt_reconnection(self.reconnect_fn());
        if scheduled {
            info!(reason, "Recovery scheduled");
            self.update(|st| {
                if st.status == ObservedStatus::Disconnected {
                    st.status = ObservedStatus::Recovering;
                }
            });
        }
        scheduled
    }

    /// Callback for the resilience engine: open a fresh transport only. The
    /// handshake is re-run when the engine reports success.
    fn reconnect_fn(self: &Arc<Self>) -> ReconnectFn {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(supervisor) => supervisor.reopen().await,
                    None => Err(SupervisorError::Disposed),
                }
            }
            .boxed()
        })
    }

    async fn reopen(self: &Arc<Self>) -> Result<(), SupervisorError> {
        if self.state.lock().identity_blocked {
            return Err(SupervisorError::IdentityInvalidated);
        }
        self.open_transport().await.map(|_| ())
    }

    /// A reopened socket is not enough; the session must be confirmed again
    async fn revalidate(self: &Arc<Self>) {
        let Some((id, transport, device_id)) = self.current_transport() else {
            return;
        };
        info!(%id, "Re-validating session after reconnect");

        let result = match self
            .session
            .request_session_info(transport.as_ref(), &device_id)
            .await
        {
            Ok(session) => self.mark_connected(id, session),
            Err(error) => Err(error.into()),
        };

        match result {
            Ok(()) => info!(%id, "Session re-validated"),
            Err(SupervisorError::Disposed | SupervisorError::Superseded) => {}
            Err(error) => {
                if !self.is_current(id) || self.is_disposed() {
                    return;
                }
                warn!(%id, "Session re-validation failed: {}", error);
                self.update(|st| st.last_error = Some(error.to_string()));
                self.disconnect(DisconnectReason::SessionRevalidationFailed)
                    .await;
            }
        }
    }

    fn spawn_aux_reconcile(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.reconcile_aux().await });
    }

    /// Start or stop the auxiliary service until it matches desired state
    async fn reconcile_aux(self: &Arc<Self>) {
        loop {
            let (want, transport, device_id) = {
                let mut st = self.state.lock();
                if self.is_disposed()
                    || st.status != ObservedStatus::Connected
                    || st.aux_in_flight
                    || st.aux_status.matches(st.desired.aux_service_running)
                {
                    return;
                }
                let Some(active) = st.transport.as_ref() else {
                    return;
                };
                let request = (
                    st.desired.aux_service_running,
                    Arc::clone(&active.handle),
                    active.device_id.clone(),
                );
                st.aux_in_flight = true;
                request
            };

            info!(want_running = want, "Reconciling auxiliary service");
            let result = if want {
                self.session
                    .start_aux_service(transport.as_ref(), &device_id)
                    .await
            } else {
                self.session
                    .stop_aux_service(transport.as_ref(), &device_id)
                    .await
            };

            let desired_moved = self.update(|st| {
                st.aux_in_flight = false;
                match &result {
                    Ok(status) => st.aux_status = *status,
                    Err(e) => st.last_error = Some(format!("aux service: {}", e)),
                }
                st.desired.aux_service_running != want
            });

            if let Err(e) = result {
                warn!("Auxiliary service request failed: {}", e);
                return;
            }
            if !desired_moved {
                return;
            }
        }
    }

    async fn invalidate_identity(self: &Arc<Self>) {
        let first = self.update(|st| {
            if st.identity_blocked {
                return false;
            }
            st.identity_blocked = true;
            st.last_error = Some(SupervisorError::IdentityInvalidated.to_string());
            true
        });
        if !first {
            return;
        }

        error!("Server invalidated the device identity");
        self.disconnect(DisconnectReason::IdentityInvalidated).await;
        self.identity.clear();
        self.emit(SupervisorEvent::IdentityInvalidated);
        self.notify(
            Notification::error(
                "Session invalidated",
                "This device is no longer authorized. Sign in again to reconnect.",
            )
            .blocking(),
        );
    }

    pub(super) fn send(&self, payload: &Value) -> bool {
        if self.is_disposed() {
            return false;
        }
        let transport = {
            let st = self.state.lock();
            if st.status != ObservedStatus::Connected {
                return false;
            }
            st.transport.as_ref().map(|active| Arc::clone(&active.handle))
        };
        transport.is_some_and(|transport| transport.send(payload.to_string()))
    }

    /// Flip the disposed flag, then stop everything. `None` if already
    /// disposed, otherwise the transport still to be closed.
    pub(super) fn shutdown(&self) -> Option<Option<Arc<dyn Transport>>> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        info!("Disposing connection supervisor");

        if let Some(event_loop) = self.event_loop.lock().take() {
            event_loop.abort();
        }
        self.heartbeat.stop();
        self.engine.dispose();
        self.session.cancel_all("disposed");

        let active = {
            let mut st = self.state.lock();
            st.status = ObservedStatus::Disconnected;
            st.quality = ConnectionQuality::Disconnected;
            st.session = None;
            st.connected_since = None;
            st.transport.take()
        };
        Some(active.map(|active| {
            active.pump.abort();
            active.handle
        }))
    }

    // ------------------------------------------------------------------
    // Event loop handlers (never await)
    // ------------------------------------------------------------------

    fn on_transport_event(self: &Arc<Self>, id: TransportId, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.route_message(id, &text),
            _ if !self.is_current(id) => {
                trace!(%id, "Ignoring event from superseded transport");
            }
            TransportEvent::Opened => debug!(%id, "Transport opened"),
            TransportEvent::Error(error) => {
                warn!(%id, "Transport error: {}", error);
                self.update(|st| st.last_error = Some(error));
            }
            TransportEvent::Closed {
                code,
                reason,
                clean,
            } => {
                let status = self.status();
                info!(%id, code, clean, status = %status, "Transport closed: {}", reason);
                match status {
                    ObservedStatus::Connected => {
                        let supervisor = Arc::clone(self);
                        tokio::spawn(async move {
                            supervisor
                                .disconnect(DisconnectReason::SocketDropped)
                                .await
                        });
                    }
                    // Fail the in-flight handshake now instead of at its timeout
                    ObservedStatus::Connecting | ObservedStatus::Recovering => {
                        self.session.cancel_all("transport closed")
                    }
                    ObservedStatus::Disconnected => {}
                }
            }
        }
    }

    fn route_message(&self, id: TransportId, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(%id, "Dropping unparseable frame: {}", e);
                return;
            }
        };

        match message {
            // Correlated by request id, so a retiring transport may still answer
            ServerMessage::Session(response) => {
                self.session.resolve(response);
            }
            _ if !self.is_current(id) => {}
            ServerMessage::HeartbeatAck(ack) => self.heartbeat.handle_ack(ack),
            ServerMessage::Other { kind, payload } => {
                if let Some(metrics) = &self.metrics {
                    metrics.messages_received_total.inc();
                }
                self.emit(SupervisorEvent::Message { kind, payload });
            }
        }
    }

    fn on_heartbeat_event(self: &Arc<Self>, event: HeartbeatEvent) {
        if event.run != self.heartbeat.current_run() {
            trace!(run = event.run, "Ignoring heartbeat event from stopped run");
            return;
        }
        if self.status() != ObservedStatus::Connected {
            return;
        }

        match event.kind {
            HeartbeatEventKind::Ack {
                latency_ms,
                quality,
                identity_valid,
                aux_status,
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_latency(latency_ms);
                }
                if !identity_valid {
                    let supervisor = Arc::clone(self);
                    tokio::spawn(async move { supervisor.invalidate_identity().await });
                    return;
                }
                let aux_changed = self.update(|st| {
                    st.quality = quality;
                    match aux_status {
                        Some(status) if status != st.aux_status => {
                            st.aux_status = status;
                            true
                        }
                        _ => false,
                    }
                });
                if aux_changed {
                    self.spawn_aux_reconcile();
                }
            }
            HeartbeatEventKind::Timeout => {
                let supervisor = Arc::clone(self);
                tokio::spawn(async move {
                    supervisor
                        .disconnect(DisconnectReason::LivenessTimeout)
                        .await
                });
            }
        }
    }

    fn on_resilience_event(self: &Arc<Self>, event: ResilienceEvent) {
        match event {
            ResilienceEvent::Failure { info, .. } => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(info.kind);
                }
            }
            ResilienceEvent::ReconnectScheduled { attempt, delay } => {
                // Refresh the published attempt number
                self.update(|_| ());
                self.notify(Notification::info(
                    "Reconnecting",
                    format!(
                        "Reconnecting (attempt {}/{}) in {:.1}s",
                        attempt,
                        self.config.resilience.max_attempts,
                        delay.as_secs_f64()
                    ),
                ));
            }
            ResilienceEvent::ReconnectSuccess { attempt } => {
                debug!(attempt, "Transport reopened, re-validating session");
                let supervisor = Arc::clone(self);
                tokio::spawn(async move { supervisor.revalidate().await });
            }
            ResilienceEvent::Suspended {
                resume_at,
                failure_count,
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.suspensions_total.inc();
                }
                self.stand_down();
                let wait = resume_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                self.notify(Notification::warning(
                    "Connection attempts paused",
                    format!(
                        "{} consecutive failures, retrying in {}s",
                        failure_count,
                        wait.as_secs()
                    ),
                ));
            }
            ResilienceEvent::Resumed => {
                info!("Reconnect attempts resumed");
                self.spawn_reconcile();
            }
            ResilienceEvent::Failed { attempts } => {
                self.stand_down();
                self.notify(Notification::error(
                    "Connection failed",
                    format!("Gave up after {} reconnect attempts", attempts),
                ));
            }
            ResilienceEvent::Abandoned { attempt, reason } => {
                info!(attempt, "Recovery stopped: {}", reason);
                self.stand_down();
                self.update(|st| st.last_error = Some(reason));
            }
            ResilienceEvent::StateChanged { .. }
            | ResilienceEvent::ReconnectAttempt { .. }
            | ResilienceEvent::ReconnectFailed { .. }
            | ResilienceEvent::Reset => {
                trace!(?event, "Resilience event");
            }
        }
    }

    /// Recovery is over without success; drop any half-open transport
    fn stand_down(&self) {
        let stale = self.update(|st| {
            if st.status != ObservedStatus::Recovering {
                return None;
            }
            st.status = ObservedStatus::Disconnected;
            st.transport.take()
        });
        if let Some(stale) = stale {
            self.retire(stale, "recovery stopped");
        }
    }

    fn on_auth_event(self: &Arc<Self>, event: AuthEvent) {
        match event {
            AuthEvent::Initialized => {
                let deferred = std::mem::take(&mut self.state.lock().reconcile_deferred);
                if deferred {
                    info!("Auth initialized, running deferred reconciliation");
                    self.spawn_reconcile();
                }
            }
            AuthEvent::Refreshed => {
                let was_blocked = std::mem::take(&mut self.state.lock().identity_blocked);
                if was_blocked || self.engine.state().forbids_attempts() {
                    info!("Fresh authentication, resetting recovery");
                    self.engine.reset();
                    self.update(|_| ());
                }
                self.spawn_reconcile();
            }
            AuthEvent::SignedOut => {
                let supervisor = Arc::clone(self);
                tokio::spawn(async move { supervisor.disconnect(DisconnectReason::AuthLost).await });
            }
        }
    }
}

/// Reasons that warrant telling the server before closing
fn graceful_stop(reason: DisconnectReason) -> bool {
    matches!(
        reason,
        DisconnectReason::UserRequested | DisconnectReason::Logout | DisconnectReason::AuthLost
    )
}

async fn pump_transport_events(
    id: TransportId,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    sink: mpsc::UnboundedSender<TransportEnvelope>,
) {
    while let Some(event) = events.recv().await {
        if sink.send((id, event)).is_err() {
            break;
        }
    }
}

async fn run_event_loop(
    supervisor: Arc<Supervisor>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEnvelope>,
    mut heartbeat_rx: mpsc::UnboundedReceiver<HeartbeatEvent>,
    mut resilience_rx: broadcast::Receiver<ResilienceEvent>,
    mut auth_rx: broadcast::Receiver<AuthEvent>,
) {
    use broadcast::error::RecvError;

    loop {
        tokio::select! {
            Some((id, event)) = transport_rx.recv() => supervisor.on_transport_event(id, event),
            Some(event) = heartbeat_rx.recv() => supervisor.on_heartbeat_event(event),
            result = resilience_rx.recv() => match result {
                Ok(event) => supervisor.on_resilience_event(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Resilience events lagged"),
                Err(RecvError::Closed) => break,
            },
            result = auth_rx.recv() => match result {
                Ok(event) => supervisor.on_auth_event(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Auth events lagged"),
                Err(RecvError::Closed) => break,
            },
            else => break,
        }
        if supervisor.is_disposed() {
            break;
        }
    }
    debug!("Supervisor event loop stopped");
}
