//! WebSocket transport over `tokio-tungstenite`
//!
//! One reader task turns frames into [`TransportEvent`]s, one writer task
//! drains an outbound queue into the sink. Both belong to a channel
//! generation; `disconnect()` bumps the generation and aborts the reader so a
//! torn-down channel never reports again.

use super::{ConnectParams, Transport, TransportEvent, TransportFactory, ABNORMAL_CLOSURE};
use crate::config::TransportConfig;
use crate::core::TransportError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Time the writer gets to flush a close frame before it is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Open,
    /// Peer closed; the channel handle is stale until the next connect
    Closed,
}

struct Channel {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Channel {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct WsState {
    phase: Phase,
    generation: u64,
    channel: Option<Channel>,
}

/// WebSocket implementation of [`Transport`]
pub struct WebSocketTransport {
    config: TransportConfig,
    state: Arc<Mutex<WsState>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: Arc::new(Mutex::new(WsState {
                phase: Phase::Idle,
                generation: 0,
                channel: None,
            })),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn build_request(
        params: &ConnectParams,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
        let separator = if params.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}deviceId={}", params.url, separator, params.device_id);

        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", params.access_token))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        Ok(request)
    }

    /// Reset the phase after a failed open, unless someone else moved on
    fn abandon_open(&self, generation: u64) {
        let mut st = self.state.lock();
        if st.generation == generation && st.phase == Phase::Connecting {
            st.phase = Phase::Idle;
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, params: ConnectParams) -> Result<bool, TransportError> {
        let request = Self::build_request(&params)?;

        let generation = {
            let mut st = self.state.lock();
            match st.phase {
                Phase::Open => return Ok(true),
                Phase::Connecting => return Ok(false),
                Phase::Idle | Phase::Closed => {}
            }
            if let Some(stale) = st.channel.take() {
                debug!("Tearing down stale channel before reconnect");
                stale.abort();
            }
            st.phase = Phase::Connecting;
            st.generation += 1;
            st.generation
        };

        info!("Opening WebSocket channel to {}", params.url);

        let ws: WsStream =
            match tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await {
                Err(_) => {
                    self.abandon_open(generation);
                    return Err(TransportError::ConnectTimeout(self.config.connect_timeout));
                }
                Ok(Err(e)) => {
                    self.abandon_open(generation);
                    return Err(TransportError::ConnectFailed(e.to_string()));
                }
                Ok(Ok((ws, _response))) => ws,
            };

        let mut st = self.state.lock();
        if st.generation != generation {
            // disconnect() ran while we were opening; drop the fresh socket
            return Err(TransportError::Aborted(
                "transport disconnected while opening".to_string(),
            ));
        }

        let (sink, stream) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            stream,
            self.events_tx.clone(),
            outbound.clone(),
            Arc::clone(&self.state),
            generation,
        ));

        st.channel = Some(Channel {
            outbound,
            reader,
            writer,
        });
        st.phase = Phase::Open;
        let _ = self.events_tx.send(TransportEvent::Opened);
        info!("WebSocket channel open");

        Ok(true)
    }

    fn send(&self, text: String) -> bool {
        let st = self.state.lock();
        match (&st.phase, &st.channel) {
            (Phase::Open, Some(channel)) => channel.outbound.send(Message::Text(text.into())).is_ok(),
            _ => false,
        }
    }

    async fn disconnect(&self, reason: &str) {
        let (channel, was_open) = {
            let mut st = self.state.lock();
            let Some(channel) = st.channel.take() else {
                if st.phase == Phase::Connecting {
                    // Abandon the in-flight open
                    st.generation += 1;
                    st.phase = Phase::Idle;
                }
                return;
            };
            let was_open = st.phase == Phase::Open;
            st.generation += 1;
            st.phase = Phase::Idle;
            (channel, was_open)
        };

        info!("Closing WebSocket channel: {}", reason);
        channel.reader.abort();

        if was_open {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            };
            let _ = channel.outbound.send(Message::Close(Some(frame)));
        }
        drop(channel.outbound);

        let mut writer = channel.writer;
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            warn!("Writer did not flush close frame in time");
            writer.abort();
        }

        if was_open {
            let _ = self.events_tx.send(TransportEvent::Closed {
                code: 1000,
                reason: reason.to_string(),
                clean: true,
            });
        }
    }

    fn is_connected(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(channel) = self.state.lock().channel.take() {
            channel.abort();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("WebSocket write failed: {}", e);
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::UnboundedSender<Message>,
    state: Arc<Mutex<WsState>>,
    generation: u64,
) {
    let mut code = ABNORMAL_CLOSURE;
    let mut reason = String::from("connection lost");
    let mut clean = false;

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let _ = events.send(TransportEvent::Message(text.to_string()));
            }
            Ok(Message::Ping(payload)) => {
                let _ = outbound.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    code = u16::from(frame.code);
                    reason = frame.reason.to_string();
                } else {
                    code = 1005;
                    reason = String::new();
                }
                clean = true;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                reason = e.to_string();
                break;
            }
        }
    }

    {
        let mut st = state.lock();
        if st.generation != generation {
            return;
        }
        st.phase = Phase::Closed;
    }

    warn!(code, clean, "WebSocket channel closed: {}", reason);
    let _ = events.send(TransportEvent::Closed {
        code,
        reason,
        clean,
    });
}

/// Creates [`WebSocketTransport`]s from a shared config
#[derive(Debug, Clone)]
pub struct WebSocketTransportFactory {
    config: TransportConfig,
}

impl WebSocketTransportFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(self.config.clone()))
    }
}
