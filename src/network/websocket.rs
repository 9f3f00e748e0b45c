//! WebSocket manager - custom headers and subprotocols, bidirectional traffic

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::error::ManagerError;
use crate::messages::{Direction, EventPayload, MessageBody, PayloadFormat};
use crate::models::{enabled_headers, ConnectOptions, OutboundPayload, Protocol, WebSocketOptions};
use crate::network::lifecycle::{
    ConnectionInfo, ConnectionManager, Connections, EventSink, Session,
};

/// How long a local close waits for the peer's close frame
const CLOSE_ACK_WAIT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn html_pattern() -> Option<&'static Regex> {
    static HTML: OnceLock<Option<Regex>> = OnceLock::new();
    HTML.get_or_init(|| Regex::new(r"(?i)^<(!doctype\s+html|html[\s>]|head[\s>]|body[\s>])").ok())
        .as_ref()
}

fn xml_pattern() -> Option<&'static Regex> {
    static XML: OnceLock<Option<Regex>> = OnceLock::new();
    XML.get_or_init(|| Regex::new(r"^<(\?xml|[A-Za-z_][\w.\-:]*[\s/>])").ok())
        .as_ref()
}

/// Guess the format of a text payload for display. Never fails.
pub fn sniff_format(text: &str) -> PayloadFormat {
    let trimmed = text.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_ok() {
            return PayloadFormat::Json;
        }
        return PayloadFormat::Text;
    }
    if trimmed.starts_with('<') {
        if html_pattern().is_some_and(|re| re.is_match(trimmed)) {
            return PayloadFormat::Html;
        }
        if xml_pattern().is_some_and(|re| re.is_match(trimmed)) {
            return PayloadFormat::Xml;
        }
    }
    PayloadFormat::Text
}

fn text_body(data: String) -> MessageBody {
    MessageBody::Text {
        format: sniff_format(&data),
        size: data.len(),
        data,
    }
}

fn binary_body(data: Vec<u8>) -> MessageBody {
    MessageBody::Binary {
        size: data.len(),
        data,
    }
}

fn build_request(options: &WebSocketOptions) -> Result<Request, ManagerError> {
    let invalid = |e: &dyn std::fmt::Display| ManagerError::InvalidOptions(e.to_string());

    let mut request = options
        .url
        .trim()
        .into_client_request()
        .map_err(|e| invalid(&e))?;

    for header in enabled_headers(&options.headers) {
        let name = HeaderName::from_bytes(header.key.trim().as_bytes()).map_err(|e| invalid(&e))?;
        let value = HeaderValue::from_str(&header.value).map_err(|e| invalid(&e))?;
        request.headers_mut().append(name, value);
    }

    if !options.protocols.is_empty() {
        let offered = options.protocols.join(", ");
        let value = HeaderValue::from_str(&offered).map_err(|e| invalid(&e))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}

pub struct WebSocketManager {
    conns: Connections<mpsc::UnboundedSender<WsMessage>>,
    connect_timeout: Duration,
}

impl WebSocketManager {
    pub fn new(config: &Config, events: EventSink) -> Self {
        WebSocketManager {
            conns: Connections::new(Protocol::WebSocket, events, config.disconnect_grace()),
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl ConnectionManager for WebSocketManager {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    async fn connect(&self, id: &str, options: ConnectOptions) -> Result<(), ManagerError> {
        let ConnectOptions::WebSocket(options) = options else {
            return Err(ManagerError::InvalidOptions(String::from(
                "expected websocket options",
            )));
        };
        let request = build_request(&options)?;
        let session = self.conns.reserve(id, &options.url)?;
        tracing::info!(id, url = %options.url, protocols = ?options.protocols, "Connecting WebSocket");

        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(request));
        let result = tokio::select! {
            biased;

            _ = session.cancel_token().cancelled() => return Err(ManagerError::Cancelled),
            result = handshake => result,
        };

        let (stream, response) = match result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                let err = ManagerError::Transport(format!("Connection failed: {}", e));
                self.conns.fail(&session, &err);
                return Err(err);
            }
            Err(_) => {
                let err = ManagerError::Transport(String::from("Connection timed out"));
                self.conns.fail(&session, &err);
                return Err(err);
            }
        };

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        session.set_negotiated(negotiated);

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let conns = self.conns.clone();
        let loop_session = Arc::clone(&session);
        let spawn = move || tokio::spawn(run_socket(conns, loop_session, stream, message_rx));
        if !self.conns.attach(&session, message_tx, spawn) {
            return Err(ManagerError::Cancelled);
        }
        tracing::info!(id, "WebSocket connected");
        Ok(())
    }

    async fn send(&self, id: &str, payload: OutboundPayload) -> Result<(), ManagerError> {
        let message = match payload {
            OutboundPayload::Text { data } => WsMessage::Text(data),
            OutboundPayload::Binary { data } => WsMessage::Binary(data),
            OutboundPayload::Event { .. } => {
                return Err(ManagerError::unsupported(Protocol::WebSocket, "named events"))
            }
        };
        let (_, message_tx) = self.conns.control(id)?;
        message_tx
            .send(message)
            .map_err(|_| ManagerError::ConnectionNotFound(id.to_string()))
    }

    async fn disconnect(&self, id: &str) {
        if let Some(entry) = self.conns.detach(id) {
            tracing::info!(id, "Closing WebSocket");
            self.conns.finish(entry, None).await;
        }
    }

    fn status(&self, id: &str) -> ConnectionInfo {
        self.conns.info(id)
    }

    async fn shutdown(&self) {
        let entries = self.conns.detach_all();
        futures_util::future::join_all(
            entries
                .into_iter()
                .map(|entry| self.conns.finish(entry, None)),
        )
        .await;
    }
}

/// Bidirectional pump for one socket, until cancelled or the peer goes away
async fn run_socket(
    conns: Connections<mpsc::UnboundedSender<WsMessage>>,
    session: Arc<Session>,
    stream: Socket,
    mut message_rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            biased;

            // Check for cancellation/close request
            _ = session.cancel_token().cancelled() => {
                let _ = write.close().await;
                let _ = tokio::time::timeout(CLOSE_ACK_WAIT, async {
                    while let Some(Ok(msg)) = read.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                })
                .await;
                return;
            }

            // Handle outgoing messages
            Some(msg) = message_rx.recv() => {
                let body = match &msg {
                    WsMessage::Text(text) => text_body(text.clone()),
                    WsMessage::Binary(data) => binary_body(data.clone()),
                    _ => continue,
                };
                if let Err(e) = write.send(msg).await {
                    conns.fail(&session, &ManagerError::Transport(format!("Send failed: {}", e)));
                    return;
                }
                session.emit_message(Direction::Sent, body);
            }

            // Handle incoming messages
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        session.emit_message(Direction::Received, text_body(text));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        session.emit_message(Direction::Received, binary_body(data));
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((1005, String::new()));
                        tracing::info!(id = %session.id(), code, reason = %reason, "WebSocket closed by peer");
                        session.emit(EventPayload::Close { code, reason: reason.clone() });
                        conns.closed_by_remote(&session, Some(reason));
                        return;
                    }
                    Some(Err(e)) => {
                        conns.fail(&session, &ManagerError::Transport(format!("Receive error: {}", e)));
                        return;
                    }
                    None => {
                        conns.closed_by_remote(&session, None);
                        return;
                    }
                }
            }
        }
    }
}
