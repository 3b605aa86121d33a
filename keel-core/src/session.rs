//! Session RPC over the transport
//!
//! Requests carry a fresh `requestId`; the orchestrator's router hands every
//! correlated response to [`SessionClient::resolve`], which wakes the waiting
//! caller. A request that sees no response within `request_timeout` fails with
//! [`HandshakeError::Timeout`]. Tearing down a transport calls `cancel_all`
//! so nobody waits on a dead channel.

use crate::config::SessionConfig;
use crate::core::{AuxStatus, HandshakeError, SessionHandle};
use crate::protocol::{ClientMessage, SessionResponse};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

type Reply = Result<SessionResponse, HandshakeError>;

pub struct SessionClient {
    config: SessionConfig,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl SessionClient {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (and thereby validate) the session for `device_id`
    pub async fn request_session_info(
        &self,
        transport: &dyn Transport,
        device_id: &str,
    ) -> Result<SessionHandle, HandshakeError> {
        let response = self
            .call(transport, |request_id| ClientMessage::RequestSessionInfo {
                request_id,
                device_id: device_id.to_string(),
            })
            .await?;

        match response.device_id {
            Some(ref id) if id != device_id => Err(HandshakeError::InvalidPayload(format!(
                "session belongs to device {}, expected {}",
                id, device_id
            ))),
            _ => Ok(SessionHandle {
                device_id: device_id.to_string(),
                aux_status: response.aux_status.unwrap_or_default(),
                expires_at: response.expires_at,
            }),
        }
    }

    pub async fn stop_session(
        &self,
        transport: &dyn Transport,
        device_id: &str,
    ) -> Result<(), HandshakeError> {
        self.call(transport, |request_id| ClientMessage::StopSession {
            request_id,
            device_id: device_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Ask the server to start the auxiliary service; returns the reported status
    pub async fn start_aux_service(
        &self,
        transport: &dyn Transport,
        device_id: &str,
    ) -> Result<AuxStatus, HandshakeError> {
        let response = self
            .call(transport, |request_id| ClientMessage::StartAuxService {
                request_id,
                device_id: device_id.to_string(),
            })
            .await?;
        Ok(response.aux_status.unwrap_or(AuxStatus::Running))
    }

    pub async fn stop_aux_service(
        &self,
        transport: &dyn Transport,
        device_id: &str,
    ) -> Result<AuxStatus, HandshakeError> {
        let response = self
            .call(transport, |request_id| ClientMessage::StopAuxService {
                request_id,
                device_id: device_id.to_string(),
            })
            .await?;
        Ok(response.aux_status.unwrap_or(AuxStatus::Stopped))
    }

    /// Deliver a correlated response; false if nobody is waiting for it
    pub fn resolve(&self, response: SessionResponse) -> bool {
        let Some(waiter) = self.pending.lock().remove(&response.request_id) else {
            debug!(request_id = %response.request_id, "Uncorrelated session response");
            return false;
        };
        waiter.send(Ok(response)).is_ok()
    }

    /// Fail every outstanding request
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelling pending session requests: {}", reason);
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(HandshakeError::Cancelled(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn call<F>(&self, transport: &dyn Transport, build: F) -> Reply
    where
        F: FnOnce(String) -> ClientMessage,
    {
        let request_id = Uuid::new_v4().to_string();
        let message = build(request_id.clone());
        let text = message
            .to_json()
            .map_err(|e| HandshakeError::InvalidPayload(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if !transport.send(text) {
            self.pending.lock().remove(&request_id);
            return Err(HandshakeError::SendFailed);
        }

        let timeout = self.config.request_timeout;
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => {
                return Err(HandshakeError::Cancelled("session client dropped".to_string()))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                warn!(%request_id, "Session request timed out after {:?}", timeout);
                return Err(HandshakeError::Timeout {
                    request_id,
                    timeout,
                });
            }
        };

        match response.error {
            Some(error) => Err(HandshakeError::Rejected(error)),
            None => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn client() -> Arc<SessionClient> {
        Arc::new(SessionClient::new(SessionConfig {
            request_timeout: Duration::from_secs(15),
        }))
    }

    fn transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::silent());
        transport.force_connected(true);
        transport
    }

    async fn next_request(transport: &MockTransport) -> Value {
        for _ in 0..100 {
            if let Some(value) = transport.sent_values().pop() {
                return value;
            }
            tokio::task::yield_now().await;
        }
        panic!("no request sent");
    }

    fn response(request_id: &str, extra: Value) -> SessionResponse {
        let mut value = serde_json::json!({"type": "session_info", "requestId": request_id});
        if let (Some(obj), Some(more)) = (value.as_object_mut(), extra.as_object()) {
            for (k, v) in more {
                obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_session_info_resolves_by_request_id() {
        let client = client();
        let transport = transport();

        let task = {
            let (client, transport) = (client.clone(), transport.clone());
            tokio::spawn(async move { client.request_session_info(transport.as_ref(), "dev-1").await })
        };

        let request = next_request(&transport).await;
        assert_eq!(request["type"], "request_session_info");
        let request_id = request["requestId"].as_str().unwrap().to_string();

        // Unknown ids are ignored
        assert!(!client.resolve(response("other", serde_json::json!({}))));
        assert!(client.resolve(response(
            &request_id,
            serde_json::json!({"deviceId": "dev-1", "expiresAt": 1234, "auxStatus": "running"})
        )));

        let handle = task.await.unwrap().unwrap();
        assert_eq!(handle.device_id, "dev-1");
        assert_eq!(handle.expires_at, Some(1234));
        assert_eq!(handle.aux_status, AuxStatus::Running);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_server_error_is_rejection() {
        let client = client();
        let transport = transport();
        let task = {
            let (client, transport) = (client.clone(), transport.clone());
            tokio::spawn(async move { client.request_session_info(transport.as_ref(), "dev-1").await })
        };

        let request = next_request(&transport).await;
        let request_id = request["requestId"].as_str().unwrap();
        client.resolve(response(request_id, serde_json::json!({"error": "session expired"})));

        assert_eq!(
            task.await.unwrap(),
            Err(HandshakeError::Rejected("session expired".to_string()))
        );
    }

    #[tokio::test]
    async fn test_device_mismatch_is_invalid_payload() {
        let client = client();
        let transport = transport();
        let task = {
            let (client, transport) = (client.clone(), transport.clone());
            tokio::spawn(async move { client.request_session_info(transport.as_ref(), "dev-1").await })
        };

        let request = next_request(&transport).await;
        let request_id = request["requestId"].as_str().unwrap();
        client.resolve(response(request_id, serde_json::json!({"deviceId": "dev-2"})));

        assert!(matches!(
            task.await.unwrap(),
            Err(HandshakeError::InvalidPayload(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let client = client();
        let transport = transport();

        let result = client.stop_session(transport.as_ref(), "dev-1").await;
        assert!(matches!(result, Err(HandshakeError::Timeout { .. })));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_when_disconnected() {
        let client = client();
        let transport = Arc::new(MockTransport::silent());

        let result = client.start_aux_service(transport.as_ref(), "dev-1").await;
        assert_eq!(result, Err(HandshakeError::SendFailed));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_waiters() {
        let client = client();
        let transport = transport();
        let task = {
            let (client, transport) = (client.clone(), transport.clone());
            tokio::spawn(async move { client.stop_aux_service(transport.as_ref(), "dev-1").await })
        };

        next_request(&transport).await;
        client.cancel_all("transport closed");
        assert_eq!(
            task.await.unwrap(),
            Err(HandshakeError::Cancelled("transport closed".to_string()))
        );
    }
}
