//! Socket.IO manager - named events over the rust_socketio async client

use async_trait::async_trait;
use base64::Engine;
use futures_util::FutureExt;
use rust_socketio::asynchronous::{Client, ClientBuilder};
use rust_socketio::{Event, Payload, TransportType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::constants::{DEFAULT_SOCKETIO_NAMESPACE, SOCKETIO_CLIENT_DISCONNECT};
use crate::error::ManagerError;
use crate::messages::{Direction, MessageBody};
use crate::models::{
    enabled_headers, ConnectOptions, OutboundPayload, Protocol, SocketIoOptions, Transport,
};
use crate::network::lifecycle::{ConnectionInfo, ConnectionManager, Connections, EventSink, Session};

/// Map a transport preference list onto the client's transport type
pub fn transport_type(transports: &[Transport]) -> TransportType {
    match transports {
        [] | [Transport::WebSocket, Transport::Polling] => TransportType::Any,
        [Transport::Polling, Transport::WebSocket] => TransportType::WebsocketUpgrade,
        [Transport::WebSocket, ..] => TransportType::Websocket,
        [Transport::Polling, ..] => TransportType::Polling,
    }
}

/// Server URL with the query parameters appended
pub fn socket_url(options: &SocketIoOptions) -> Result<String, ManagerError> {
    let mut url = reqwest::Url::parse(options.url.trim())
        .map_err(|e| ManagerError::InvalidOptions(format!("{}: {}", options.url, e)))?;
    if !options.query.is_empty() {
        url.query_pairs_mut().extend_pairs(options.query.iter());
    }
    Ok(url.into())
}

/// Argument list carried by an inbound payload
pub fn payload_args(payload: Payload) -> Vec<Value> {
    #[allow(deprecated)]
    match payload {
        Payload::Text(values) => values,
        Payload::Binary(bytes) => vec![Value::String(
            base64::engine::general_purpose::STANDARD.encode(&bytes),
        )],
        Payload::String(text) => {
            vec![serde_json::from_str(&text).unwrap_or(Value::String(text))]
        }
    }
}

/// First string argument, used as a close or error reason
fn payload_reason(payload: Payload) -> Option<String> {
    payload_args(payload).into_iter().find_map(|arg| match arg {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub struct SocketIoManager {
    conns: Connections<Client>,
    connect_timeout: Duration,
}

impl SocketIoManager {
    pub fn new(config: &Config, events: EventSink) -> Self {
        SocketIoManager {
            conns: Connections::new(Protocol::SocketIo, events, config.disconnect_grace()),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn builder(&self, session: &Arc<Session>, options: &SocketIoOptions, url: String) -> ClientBuilder {
        let namespace = options
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_SOCKETIO_NAMESPACE);

        let mut builder = ClientBuilder::new(url)
            .namespace(namespace)
            .transport_type(transport_type(&options.transports))
            .reconnect(false);

        if let Some(auth) = &options.auth {
            builder = builder.auth(auth.clone());
        }
        for header in enabled_headers(&options.headers) {
            builder = builder.opening_header(header.key.trim(), header.value.clone());
        }

        let on_event = Arc::clone(session);
        let on_close = (self.conns.clone(), Arc::clone(session));
        let on_error = (self.conns.clone(), Arc::clone(session));

        builder
            .on_any(move |event: Event, payload: Payload, _client: Client| {
                on_event.emit_message(
                    Direction::Received,
                    MessageBody::SocketIo {
                        event: event.as_str().to_string(),
                        args: payload_args(payload),
                    },
                );
                async {}.boxed()
            })
            .on(Event::Close, move |payload: Payload, _client: Client| {
                let (conns, session) = &on_close;
                let reason = payload_reason(payload);
                tracing::info!(id = %session.id(), reason = ?reason, "Socket.IO connection closed");
                conns.closed_by_remote(session, reason);
                async {}.boxed()
            })
            .on(Event::Error, move |payload: Payload, _client: Client| {
                let (conns, session) = &on_error;
                let message = payload_reason(payload).unwrap_or_else(|| String::from("Socket.IO error"));
                conns.fail(session, &ManagerError::Transport(message));
                async {}.boxed()
            })
    }
}

#[async_trait]
impl ConnectionManager for SocketIoManager {
    fn protocol(&self) -> Protocol {
        Protocol::SocketIo
    }

    async fn connect(&self, id: &str, options: ConnectOptions) -> Result<(), ManagerError> {
        let ConnectOptions::SocketIo(options) = options else {
            return Err(ManagerError::InvalidOptions(String::from(
                "expected socket.io options",
            )));
        };
        let url = socket_url(&options)?;
        let session = self.conns.reserve(id, &options.url)?;
        tracing::info!(id, url = %url, namespace = ?options.namespace, "Connecting Socket.IO");

        let handshake = tokio::time::timeout(
            self.connect_timeout,
            self.builder(&session, &options, url).connect(),
        );
        let result = tokio::select! {
            biased;

            _ = session.cancel_token().cancelled() => return Err(ManagerError::Cancelled),
            result = handshake => result,
        };

        let client = match result {
            Ok(Ok(client)) => client,
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

        // The client runs its own read loop; ours only closes it on cancellation
        let token = session.cancel_token().clone();
        let closer = client.clone();
        let spawn = move || {
            tokio::spawn(async move {
                token.cancelled().await;
                if let Err(e) = closer.disconnect().await {
                    tracing::debug!(error = %e, "Socket.IO disconnect failed");
                }
            })
        };
        if !self.conns.attach(&session, client.clone(), spawn) {
            let _ = client.disconnect().await;
            return Err(ManagerError::Cancelled);
        }
        tracing::info!(id, "Socket.IO connected");
        Ok(())
    }

    async fn send(&self, id: &str, payload: OutboundPayload) -> Result<(), ManagerError> {
        let OutboundPayload::Event { event, args } = payload else {
            return Err(ManagerError::unsupported(Protocol::SocketIo, "raw frames"));
        };
        let (session, client) = self.conns.control(id)?;
        client
            .emit(event.as_str(), Payload::Text(args.clone()))
            .await
            .map_err(|e| ManagerError::Transport(format!("Emit failed: {}", e)))?;
        session.emit_message(Direction::Sent, MessageBody::SocketIo { event, args });
        Ok(())
    }

    async fn disconnect(&self, id: &str) {
        if let Some(entry) = self.conns.detach(id) {
            tracing::info!(id, "Disconnecting Socket.IO");
            self.conns
                .finish(entry, Some(String::from(SOCKETIO_CLIENT_DISCONNECT)))
                .await;
        }
    }

    fn status(&self, id: &str) -> ConnectionInfo {
        self.conns.info(id)
    }

    async fn shutdown(&self) {
        let entries = self.conns.detach_all();
        futures_util::future::join_all(entries.into_iter().map(|entry| {
            self.conns
                .finish(entry, Some(String::from(SOCKETIO_CLIENT_DISCONNECT)))
        }))
        .await;
    }
}
