//! Websocket client for the provider's real-time news stream
//!
//! Protocol: the server greets with `[{"T":"success","msg":"connected"}]`,
//! the client authenticates with `{"action":"auth",...}` and waits for
//! `authenticated`, then sends a single `{"action":"subscribe","news":[..]}`.
//! Every later frame is a JSON array of elements; `"T":"n"` elements are
//! news items.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{FeedError, FeedEvent, StreamProvider};
use crate::config::AlpacaConfig;
use crate::types::{RawMessage, SubscriptionScope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider error codes that mean the session can never deliver news
/// (not authenticated, auth failed, auth timeout, connection limit,
/// insufficient subscription).
const FATAL_ERROR_CODES: [i64; 5] = [401, 402, 404, 406, 409];

/// WebSocket streaming client for the news feed
pub struct AlpacaNewsStream {
    url: String,
    api_key: String,
    secret_key: String,
    handshake_timeout: Duration,
    /// Authenticated socket waiting for `subscribe`
    socket: Option<WsStream>,
    reader: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
    scope: Option<SubscriptionScope>,
}

impl AlpacaNewsStream {
    /// Create new WebSocket stream
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            socket: None,
            reader: None,
            stop: None,
            scope: None,
        }
    }

    pub fn from_config(config: &AlpacaConfig) -> Self {
        Self::new(&config.stream_url, &config.api_key, &config.secret_key)
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

#[async_trait]
impl StreamProvider for AlpacaNewsStream {
    async fn connect(&mut self) -> Result<(), FeedError> {
        if self.socket.is_some() || self.reader.is_some() {
            return Ok(());
        }
        let greeting = handshake(&self.url, &self.api_key, &self.secret_key);
        let ws = timeout(self.handshake_timeout, greeting)
            .await
            .map_err(|_| {
                let waited = self.handshake_timeout;
                FeedError::Connect(format!("handshake timed out after {waited:?}"))
            })??;
        self.socket = Some(ws);
        Ok(())
    }

    async fn subscribe(
        &mut self,
        scope: &SubscriptionScope,
        tx: mpsc::Sender<FeedEvent>,
    ) -> Result<(), FeedError> {
        if let Some(active) = &self.scope {
            if active == scope {
                debug!(scope = %scope, "subscription already active");
                return Ok(());
            }
            return Err(FeedError::AlreadySubscribed(active.to_string()));
        }

        let mut ws = self.socket.take().ok_or(FeedError::NotConnected)?;
        let request = json!({
            "action": "subscribe",
            "news": scope.wire_symbols(),
        });
        ws.send(Message::Text(request.to_string()))
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;

        let (write, read) = ws.split();
        let (stop_tx, stop_rx) = oneshot::channel();
        self.reader = Some(tokio::spawn(pump(read, write, tx, stop_rx)));
        self.stop = Some(stop_tx);
        self.scope = Some(scope.clone());

        info!(scope = %scope, "Subscribed to news updates");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), FeedError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(mut handle) = self.reader.take() {
            if timeout(READER_STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("News stream reader did not stop in time, aborting");
                handle.abort();
            }
        }
        if let Some(mut ws) = self.socket.take() {
            let _ = ws.close(None).await;
        }
        self.scope = None;
        debug!("News stream released");
        Ok(())
    }
}

/// Connects, waits for the greeting and authenticates.
async fn handshake(url: &str, api_key: &str, secret_key: &str) -> Result<WsStream, FeedError> {
    info!("Connecting to news stream: {}", url);
    let (mut ws, _response) = connect_async(url)
        .await
        .map_err(|e| FeedError::Connect(e.to_string()))?;

    await_control(&mut ws, "connected").await?;

    let auth = json!({
        "action": "auth",
        "key": api_key,
        "secret": secret_key,
    });
    ws.send(Message::Text(auth.to_string()))
        .await
        .map_err(|e| FeedError::Connect(e.to_string()))?;

    await_control(&mut ws, "authenticated").await?;
    info!("News stream authenticated");
    Ok(ws)
}

/// Reads frames until `control` arrives as a `success` message.
async fn await_control(ws: &mut WsStream, control: &str) -> Result<(), FeedError> {
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| FeedError::Connect(e.to_string()))? {
            Message::Text(text) => {
                let elements = parse_elements(text.as_bytes()).ok_or_else(|| {
                    FeedError::Protocol(format!("unexpected handshake frame: {text}"))
                })?;
                if control_reached(elements, control)? {
                    return Ok(());
                }
            }
            Message::Binary(data) => {
                let elements = parse_elements(&data).ok_or_else(|| {
                    FeedError::Protocol(format!("unexpected {} byte handshake frame", data.len()))
                })?;
                if control_reached(elements, control)? {
                    return Ok(());
                }
            }
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload))
                    .await
                    .map_err(|e| FeedError::Connect(e.to_string()))?;
            }
            Message::Close(_) => {
                return Err(FeedError::Connect(format!(
                    "server closed the connection while waiting for {control:?}"
                )));
            }
            _ => {}
        }
    }
    Err(FeedError::Connect(format!(
        "stream ended while waiting for {control:?}"
    )))
}

fn control_reached(elements: Vec<Value>, control: &str) -> Result<bool, FeedError> {
    for element in elements {
        match classify_element(&element) {
            Element::Success(msg) if msg == control => return Ok(true),
            Element::Error { code, message } => return Err(error_from_code(code, message)),
            other => debug!(?other, "ignoring element during handshake"),
        }
    }
    Ok(false)
}

/// Reader task: forwards messages until stopped or the transport drops.
async fn pump(
    mut read: SplitStream<WsStream>,
    mut write: SplitSink<WsStream, Message>,
    tx: mpsc::Sender<FeedEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = write.send(Message::Close(None)).await;
                return;
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match forward_payload(Payload::Text(text), &tx).await {
                        Forwarded::Continue => {}
                        Forwarded::ReceiverGone => return,
                        Forwarded::Fatal(reason) => break reason,
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    match forward_payload(Payload::Binary(data), &tx).await {
                        Forwarded::Continue => {}
                        Forwarded::ReceiverGone => return,
                        Forwarded::Fatal(reason) => break reason,
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => {
                            format!("server closed connection: {} {}", frame.code, frame.reason)
                        }
                        None => "server closed connection".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read error: {e}"),
                None => break "stream ended".to_string(),
            }
        }
    };

    warn!(reason = %reason, "News stream disconnected");
    let _ = tx.send(FeedEvent::Disconnected(reason)).await;
}

enum Forwarded {
    Continue,
    ReceiverGone,
    Fatal(String),
}

/// Data frame body; text and binary frames carry the same JSON batches.
enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(data) => data.as_slice(),
        }
    }

    fn into_raw(self) -> RawMessage {
        match self {
            Payload::Text(text) => RawMessage::Text(text),
            Payload::Binary(data) => RawMessage::Binary(data.into()),
        }
    }
}

async fn forward_payload(payload: Payload, tx: &mpsc::Sender<FeedEvent>) -> Forwarded {
    let Some(elements) = parse_elements(payload.as_bytes()) else {
        // undecodable payloads still go to the validator, which rejects them
        return match tx.send(FeedEvent::Message(payload.into_raw())).await {
            Ok(()) => Forwarded::Continue,
            Err(_) => Forwarded::ReceiverGone,
        };
    };

    for element in elements {
        match classify_element(&element) {
            Element::News | Element::Other => {
                let event = FeedEvent::Message(RawMessage::Structured(element));
                if tx.send(event).await.is_err() {
                    return Forwarded::ReceiverGone;
                }
            }
            Element::Subscription(symbols) => info!(?symbols, "Subscription confirmed"),
            Element::Success(msg) => debug!(msg = %msg, "control message"),
            Element::Error { code, message } => {
                warn!(?code, message = %message, "Feed reported an error");
                if code.is_some_and(|c| FATAL_ERROR_CODES.contains(&c)) {
                    return Forwarded::Fatal(format!("feed error {code:?}: {message}"));
                }
            }
        }
    }
    Forwarded::Continue
}

/// Kind of a single element inside a frame
#[derive(Debug, Clone, PartialEq, Eq)]
enum Element {
    News,
    Success(String),
    Subscription(Vec<String>),
    Error { code: Option<i64>, message: String },
    Other,
}

fn classify_element(element: &Value) -> Element {
    let text = |key: &str| {
        element
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    match element.get("T").and_then(Value::as_str) {
        Some("n") => Element::News,
        Some("success") => Element::Success(text("msg")),
        Some("subscription") => Element::Subscription(
            element
                .get("news")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        ),
        Some("error") => Element::Error {
            code: element.get("code").and_then(Value::as_i64),
            message: text("msg"),
        },
        _ => Element::Other,
    }
}

/// Frames are arrays of elements; a bare object counts as one element.
fn parse_elements(payload: &[u8]) -> Option<Vec<Value>> {
    match serde_json::from_slice::<Value>(payload).ok()? {
        Value::Array(items) => Some(items),
        other => Some(vec![other]),
    }
}

fn error_from_code(code: Option<i64>, message: String) -> FeedError {
    match code {
        Some(c) if FATAL_ERROR_CODES.contains(&c) => {
            FeedError::Auth(format!("{c}: {message}"))
        }
        Some(c) => FeedError::Protocol(format!("{c}: {message}")),
        None => FeedError::Protocol(message),
    }
}
