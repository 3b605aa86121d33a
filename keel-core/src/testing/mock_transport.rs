//! Scriptable in-memory transport
//!
//! `MockTransport` keeps every frame the supervisor sends and can answer them
//! through a [`Responder`], which is how tests play the server side of the
//! session handshake and heartbeat. `MockTransportFactory` hands out one
//! transport per connection attempt, each with the next scripted outcome.

use crate::core::{unix_millis, TransportError};
use crate::transport::{ConnectParams, Transport, TransportEvent, TransportFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Server-side reply to a frame the supervisor sent, if any
pub type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// What `connect()` does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Succeed,
    Fail(String),
    /// Succeed after a delay
    Delay(Duration),
}

/// Answers heartbeats and session requests like a healthy server
pub fn default_responder() -> Responder {
    Arc::new(|frame: &Value| {
        let kind = frame.get("type")?.as_str()?;
        let request_id = frame.get("requestId").cloned().unwrap_or(Value::Null);
        match kind {
            "heartbeat" => Some(json!({
                "type": "heartbeat_ack",
                "clientTimestamp": frame["timestamp"],
                "identityValid": true,
            })),
            "request_session_info" => Some(json!({
                "type": "session_info",
                "requestId": request_id,
                "deviceId": frame["deviceId"],
                "expiresAt": unix_millis() + 3_600_000,
                "auxStatus": "stopped",
            })),
            "stop_session" => Some(json!({"type": "session_stopped", "requestId": request_id})),
            "start_aux_service" => Some(json!({
                "type": "aux_service",
                "requestId": request_id,
                "auxStatus": "running",
            })),
            "stop_aux_service" => Some(json!({
                "type": "aux_service",
                "requestId": request_id,
                "auxStatus": "stopped",
            })),
            _ => None,
        }
    })
}

/// Healthy server, except `kind` frames get `reply` (or no answer at all)
pub fn responder_overriding(kind: &'static str, reply: Option<Value>) -> Responder {
    let healthy = default_responder();
    Arc::new(move |frame: &Value| {
        if frame.get("type").and_then(Value::as_str) == Some(kind) {
            let mut reply = reply.clone()?;
            if let (Some(obj), Some(id)) = (reply.as_object_mut(), frame.get("requestId")) {
                obj.entry("requestId").or_insert_with(|| id.clone());
            }
            if let (Some(obj), Some(ts)) = (reply.as_object_mut(), frame.get("timestamp")) {
                obj.entry("clientTimestamp").or_insert_with(|| ts.clone());
            }
            return Some(reply);
        }
        healthy(frame)
    })
}

pub struct MockTransport {
    index: usize,
    outcome: ConnectOutcome,
    responder: Option<Responder>,
    connected: AtomicBool,
    connect_calls: AtomicU32,
    last_params: Mutex<Option<ConnectParams>>,
    sent: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    pub fn new(index: usize, outcome: ConnectOutcome, responder: Option<Responder>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            index,
            outcome,
            responder,
            connected: AtomicBool::new(false),
            connect_calls: AtomicU32::new(0),
            last_params: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Connects fine, never answers
    pub fn silent() -> Self {
        Self::new(0, ConnectOutcome::Succeed, None)
    }

    /// Connects fine, answers like a healthy server
    pub fn responsive() -> Self {
        Self::new(0, ConnectOutcome::Succeed, Some(default_responder()))
    }

    /// Creation order within its factory
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn force_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Deliver a frame as if the server sent it
    pub fn inject(&self, payload: Value) {
        let _ = self.events_tx.send(TransportEvent::Message(payload.to_string()));
    }

    /// Simulate the peer vanishing
    pub fn drop_connection(&self, code: u16, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
            clean: false,
        });
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<ConnectParams> {
        self.last_params.lock().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn sent_values(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.sent_values()
            .into_iter()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some(kind))
            .collect()
    }

    /// Reasons passed to `disconnect()`, including no-op calls
    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().clone()
    }

    fn open(&self) -> Result<bool, TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(TransportEvent::Opened);
        Ok(true)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, params: ConnectParams) -> Result<bool, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock() = Some(params);
        if self.connected.load(Ordering::SeqCst) {
            return Ok(true);
        }

        match &self.outcome {
            ConnectOutcome::Succeed => self.open(),
            ConnectOutcome::Fail(message) => Err(TransportError::ConnectFailed(message.clone())),
            ConnectOutcome::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                self.open()
            }
        }
    }

    fn send(&self, text: String) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let reply = self.responder.as_ref().and_then(|respond| {
            serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|frame| respond(&frame))
        });
        self.sent.lock().push(text);
        if let Some(reply) = reply {
            let _ = self.events_tx.send(TransportEvent::Message(reply.to_string()));
        }
        true
    }

    async fn disconnect(&self, reason: &str) {
        self.disconnects.lock().push(reason.to_string());
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events_tx.send(TransportEvent::Closed {
                code: 1000,
                reason: reason.to_string(),
                clean: true,
            });
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

/// Factory that scripts one outcome per created transport
pub struct MockTransportFactory {
    outcomes: Mutex<VecDeque<ConnectOutcome>>,
    default_outcome: Mutex<ConnectOutcome>,
    responder: Mutex<Option<Responder>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            default_outcome: Mutex::new(ConnectOutcome::Succeed),
            responder: Mutex::new(Some(default_responder())),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Outcome for the next transport created
    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        self.outcomes.lock().push_back(outcome);
    }

    /// Outcome once the script runs out
    pub fn set_default_outcome(&self, outcome: ConnectOutcome) {
        *self.default_outcome.lock() = outcome;
    }

    /// Responder for transports created from now on
    pub fn set_responder(&self, responder: Option<Responder>) {
        *self.responder.lock() = responder;
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn transport(&self, index: usize) -> Option<Arc<MockTransport>> {
        self.created.lock().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        let outcome = self
            .outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.lock().clone());
        let responder = self.responder.lock().clone();

        let mut created = self.created.lock();
        let transport = Arc::new(MockTransport::new(created.len(), outcome, responder));
        created.push(Arc::clone(&transport));
        transport
    }
}
