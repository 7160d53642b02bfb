//! The single control-channel connection to the relay.
//!
//! Socket I/O runs in a spawned task that reports back over an mpsc channel.
//! Every connection attempt gets a new generation number; events carrying an
//! older generation belong to a superseded socket and are ignored.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::models::ConnectionState;
use crate::protocol::{ClientMessage, encode_client_message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { generation: u64 },
    Frame { generation: u64, text: String },
    Closed { generation: u64, reason: String },
}

impl ConnectionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ConnectionEvent::Opened { generation }
            | ConnectionEvent::Frame { generation, .. }
            | ConnectionEvent::Closed { generation, .. } => *generation,
        }
    }
}

pub struct ConnectionManager {
    url: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<tungstenite::Message>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    reconnect_at: Option<Instant>,
    socket_cancel: Option<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            state: ConnectionState::Disconnected,
            generation: 0,
            outbound: None,
            events,
            reconnect_at: None,
            socket_cancel: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the next automatic reconnect is due, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Open the control channel. No-op while a connection is open or opening.
    pub fn connect(&mut self, bearer: Option<String>) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!("connect() ignored, channel is {:?}", self.state);
            return false;
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outbound = Some(out_tx);

        let cancel = CancellationToken::new();
        self.socket_cancel = Some(cancel.clone());

        info!("Connecting to {} (attempt #{})", self.url, self.generation);
        tokio::spawn(run_socket(
            self.url.clone(),
            bearer,
            self.generation,
            self.events.clone(),
            out_rx,
            cancel,
        ));
        true
    }

    /// Returns false for events from a superseded socket.
    pub fn on_opened(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Connected;
        info!("Control channel connected");
        true
    }

    pub fn accepts(&self, generation: u64) -> bool {
        generation == self.generation && self.state == ConnectionState::Connected
    }

    /// Marks the channel down and schedules the next attempt. Returns false
    /// for events from a superseded socket.
    pub fn on_closed(&mut self, generation: u64, reason: &str) -> bool {
        if generation != self.generation || self.state == ConnectionState::Disconnected {
            return false;
        }
        info!(
            "Control channel closed ({}), retrying in {:?}",
            reason, self.reconnect_delay
        );
        self.state = ConnectionState::Disconnected;
        self.outbound = None;
        self.socket_cancel = None;
        self.reconnect_at = Some(Instant::now() + self.reconnect_delay);
        true
    }

    /// Called when the reconnect deadline fires.
    pub fn take_reconnect(&mut self) -> bool {
        self.reconnect_at.take().is_some()
    }

    /// Fire-and-forget. Messages are dropped, not queued, unless connected.
    pub fn send(&self, msg: &ClientMessage) -> bool {
        let outbound = match (&self.outbound, self.state) {
            (Some(tx), ConnectionState::Connected) => tx,
            _ => {
                debug!("Dropping {:?}, control channel is {:?}", msg, self.state);
                return false;
            }
        };
        let json = match encode_client_message(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {:?}: {}", msg, e);
                return false;
            }
        };
        outbound.send(tungstenite::Message::Text(json.into())).is_ok()
    }

    /// Close the socket and cancel any pending reconnect.
    pub fn shutdown(&mut self) {
        if let Some(cancel) = self.socket_cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
        self.reconnect_at = None;
        self.state = ConnectionState::Disconnected;
        // anything still in flight from the old socket is now stale
        self.generation += 1;
    }
}

fn build_request(
    url: &str,
    bearer: Option<&str>,
) -> Result<tungstenite::handshake::client::Request, ClientError> {
    let mut request = url
        .into_client_request()
        .map_err(ClientError::from_tungstenite)?;
    if let Some(token) = bearer {
        let value = tungstenite::http::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ClientError::Other(e.into()))?;
        request
            .headers_mut()
            .insert(tungstenite::http::header::AUTHORIZATION, value);
    }
    Ok(request)
}

async fn run_socket(
    url: String,
    bearer: Option<String>,
    generation: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut outbound: mpsc::UnboundedReceiver<tungstenite::Message>,
    cancel: CancellationToken,
) {
    let closed = |reason: String| ConnectionEvent::Closed { generation, reason };

    let request = match build_request(&url, bearer.as_deref()) {
        Ok(r) => r,
        Err(e) => {
            warn!("Invalid control channel request: {}", e);
            let _ = events.send(closed(e.to_string()));
            return;
        }
    };

    let ws = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(request) => match result {
            Ok((ws, _)) => ws,
            Err(e) => {
                let err = ClientError::from_tungstenite(e);
                debug!("Control channel connect failed: {}", err);
                let _ = events.send(closed(err.to_string()));
                return;
            }
        },
    };

    if events.send(ConnectionEvent::Opened { generation }).is_err() {
        return;
    }

    let (mut ws_write, mut ws_read) = ws.split();
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_write.close().await;
                return;
            }
            out = outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = ws_write.send(msg).await {
                        break format!("write failed: {}", e);
                    }
                }
                None => {
                    let _ = ws_write.close().await;
                    break "closed locally".to_string();
                }
            },
            inbound = ws_read.next() => match inbound {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let frame = ConnectionEvent::Frame { generation, text: text.to_string() };
                    if events.send(frame).is_err() {
                        return;
                    }
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("closed by relay: {}", f.reason))
                        .unwrap_or_else(|| "closed by relay".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
        }
    };

    let _ = events.send(closed(reason));
}
