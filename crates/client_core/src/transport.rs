//! Transport sessions carrying socket events between client and server.
//!
//! A [`TransportConnector`] opens one [`TransportSession`]: an outbound sender
//! and an inbound receiver backed by background pump tasks. The inbound
//! channel closing is the only signal that the session has dropped.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::protocol::{ClientEvent, ServerEvent};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

const SOCKET_PATH: &str = "socket";
const POLL_PATH: &str = "socket/poll";
const POLL_HANDSHAKE_PATH: &str = "socket/poll/handshake";
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Polling => "polling",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" | "web_socket" => Some(TransportKind::WebSocket),
            "polling" | "long_polling" | "long-polling" => Some(TransportKind::Polling),
            _ => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved socket endpoint derived from the configured base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    http: Url,
    ws: Url,
}

impl Endpoint {
    pub fn from_base_url(base_url: &str) -> Result<Self, TransportError> {
        let mut http = Url::parse(base_url.trim())
            .map_err(|err| TransportError::InvalidEndpoint(format!("{base_url}: {err}")))?;
        let ws_scheme = match http.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "base url must start with http:// or https://, got {other}://"
                )))
            }
        };
        if !http.path().ends_with('/') {
            let path = format!("{}/", http.path());
            http.set_path(&path);
        }
        let mut ws = http
            .join(SOCKET_PATH)
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))?;
        ws.set_scheme(ws_scheme).map_err(|()| {
            TransportError::InvalidEndpoint(format!("cannot derive {ws_scheme} url from {http}"))
        })?;
        Ok(Self { http, ws })
    }

    pub fn websocket_url(&self) -> &Url {
        &self.ws
    }

    pub fn http_url(&self, path: &str) -> Result<Url, TransportError> {
        self.http
            .join(path)
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))
    }
}

/// One live transport session. Dropping it aborts the pump tasks.
pub struct TransportSession {
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    inbound: mpsc::UnboundedReceiver<ServerEvent>,
    close_tx: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(
        kind: TransportKind,
        outbound: mpsc::UnboundedSender<ClientEvent>,
        inbound: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        Self {
            kind,
            outbound,
            inbound,
            close_tx: None,
            writer: None,
            tasks: Vec::new(),
        }
    }

    fn with_pumps(
        mut self,
        close_tx: oneshot::Sender<()>,
        writer: JoinHandle<()>,
        reader: JoinHandle<()>,
    ) -> Self {
        self.close_tx = Some(close_tx);
        self.writer = Some(writer);
        self.tasks.push(reader);
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.outbound.clone()
    }

    /// Next inbound event; `None` once the transport has dropped.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.inbound.recv().await
    }

    /// Asks the writer to close the transport cleanly, then tears down.
    pub async fn close(mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                debug!(transport = %self.kind, "transport writer did not finish closing in time");
                writer.abort();
            }
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    fn kind(&self) -> TransportKind;
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportSession, TransportError>;
}

/// Full-duplex transport over a WebSocket carrying JSON text frames.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl TransportConnector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<TransportSession, TransportError> {
        let url = endpoint.websocket_url();
        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Handshake {
                    kind: TransportKind::WebSocket,
                    message: format!("failed to connect websocket {url}: {err}"),
                })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "socket: skipping undecodable websocket frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "socket: websocket receive failed");
                        break;
                    }
                }
            }
        });

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = ws_writer.send(Message::Close(None)).await;
                        break;
                    }
                    event = out_rx.recv() => {
                        let Some(event) = event else {
                            let _ = ws_writer.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(%err, event = event.name(), "socket: failed to encode outbound event");
                                continue;
                            }
                        };
                        if let Err(err) = ws_writer.send(Message::Text(text)).await {
                            warn!(%err, "socket: websocket send failed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(TransportSession::new(TransportKind::WebSocket, out_tx, in_rx)
            .with_pumps(close_tx, writer, reader))
    }
}

#[derive(Debug, Deserialize)]
struct PollHandshake {
    sid: String,
}

/// Half-duplex fallback: inbound events arrive through held-open GET
/// requests, outbound events are POSTed in batches.
#[derive(Debug, Clone)]
pub struct LongPollConnector {
    http: Client,
    poll_timeout: Duration,
}

impl Default for LongPollConnector {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl LongPollConnector {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            poll_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}

fn handshake_error(message: impl fmt::Display) -> TransportError {
    TransportError::Handshake {
        kind: TransportKind::Polling,
        message: message.to_string(),
    }
}

#[async_trait]
impl TransportConnector for LongPollConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<TransportSession, TransportError> {
        let handshake_url = endpoint.http_url(POLL_HANDSHAKE_PATH)?;
        let handshake: PollHandshake = self
            .http
            .post(handshake_url)
            .send()
            .await
            .map_err(handshake_error)?
            .error_for_status()
            .map_err(handshake_error)?
            .json()
            .await
            .map_err(handshake_error)?;

        let mut poll_url = endpoint.http_url(POLL_PATH)?;
        poll_url.query_pairs_mut().append_pair("sid", &handshake.sid);
        debug!(sid = handshake.sid.as_str(), "socket: long-poll session opened");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let http = self.http.clone();
        let url = poll_url.clone();
        let poll_timeout = self.poll_timeout;
        let reader = tokio::spawn(async move {
            loop {
                let response = match http.get(url.clone()).timeout(poll_timeout).send().await {
                    Ok(response) => response,
                    Err(err) if err.is_timeout() => continue,
                    Err(err) => {
                        warn!(%err, "socket: long-poll request failed");
                        break;
                    }
                };
                if !response.status().is_success() {
                    warn!(status = response.status().as_u16(), "socket: long-poll session rejected");
                    break;
                }
                let frames: Vec<serde_json::Value> = match response.json().await {
                    Ok(frames) => frames,
                    Err(err) => {
                        warn!(%err, "socket: long-poll payload was not a JSON array");
                        break;
                    }
                };
                for frame in frames {
                    match serde_json::from_value::<ServerEvent>(frame) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(err) => warn!(%err, "socket: skipping undecodable long-poll frame"),
                    }
                }
            }
        });

        let http = self.http.clone();
        let writer = tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = &mut close_rx => break,
                    event = out_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let mut batch = vec![first];
                while let Ok(event) = out_rx.try_recv() {
                    batch.push(event);
                }
                match http.post(poll_url.clone()).json(&batch).send().await {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        warn!(status = response.status().as_u16(), "socket: long-poll send rejected");
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "socket: long-poll send failed");
                        break;
                    }
                }
            }
        });

        Ok(TransportSession::new(TransportKind::Polling, out_tx, in_rx)
            .with_pumps(close_tx, writer, reader))
    }
}
