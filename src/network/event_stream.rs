//! Event-stream manager - long-lived GET responses decoded frame by frame

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::ManagerError;
use crate::messages::{Direction, MessageBody};
use crate::models::{enabled_headers, ConnectOptions, OutboundPayload, Protocol, SseOptions};
use crate::network::lifecycle::{ConnectionInfo, ConnectionManager, Connections, EventSink, Session};
use crate::network::sse::FrameParser;

const EVENT_STREAM: &str = "text/event-stream";

pub struct SseManager {
    client: reqwest::Client,
    conns: Connections<()>,
    connect_timeout: Duration,
}

impl SseManager {
    pub fn new(config: &Config, events: EventSink) -> Self {
        // No total timeout: the body is open-ended
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        SseManager {
            client,
            conns: Connections::new(Protocol::Sse, events, config.disconnect_grace()),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn build_request(&self, options: &SseOptions) -> reqwest::RequestBuilder {
        let mut req_builder = self
            .client
            .get(options.url.trim())
            .header(ACCEPT, EVENT_STREAM)
            .header(CACHE_CONTROL, "no-cache");
        for header in enabled_headers(&options.headers) {
            req_builder = req_builder.header(header.key.trim(), &header.value);
        }
        req_builder
    }

    /// Announce the stream and start reading it. The `connected` marker only goes
    /// out together with the read loop, which owns the closing marker.
    fn start(&self, session: &Arc<Session>, response: reqwest::Response) -> bool {
        let conns = self.conns.clone();
        let loop_session = Arc::clone(session);
        self.conns.attach(session, (), move || {
            loop_session.emit_message(Direction::System, MessageBody::Connected);
            tokio::spawn(run_stream(conns, loop_session, response))
        })
    }

    async fn open(&self, options: &SseOptions) -> Result<reqwest::Response, ManagerError> {
        let response = tokio::time::timeout(self.connect_timeout, self.build_request(options).send())
            .await
            .map_err(|_| ManagerError::Transport(String::from("Connection timed out")))??;

        let status = response.status();
        if !status.is_success() {
            return Err(ManagerError::Transport(format!(
                "Unexpected status {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let essence = content_type.split(';').next().unwrap_or("").trim();
        if !essence.eq_ignore_ascii_case(EVENT_STREAM) {
            return Err(ManagerError::Transport(format!(
                "Unexpected content type: {}",
                if content_type.is_empty() { "<none>" } else { content_type }
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ConnectionManager for SseManager {
    fn protocol(&self) -> Protocol {
        Protocol::Sse
    }

    async fn connect(&self, id: &str, options: ConnectOptions) -> Result<(), ManagerError> {
        let ConnectOptions::Sse(options) = options else {
            return Err(ManagerError::InvalidOptions(String::from(
                "expected event-stream options",
            )));
        };
        // Surface malformed URLs and headers before claiming the id
        self.build_request(&options).build()?;

        let session = self.conns.reserve(id, &options.url)?;
        tracing::info!(id, url = %options.url, "Opening event stream");

        let result = tokio::select! {
            biased;

            _ = session.cancel_token().cancelled() => return Err(ManagerError::Cancelled),
            result = self.open(&options) => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                session.emit_message(Direction::System, MessageBody::Error { message: err.to_string() });
                self.conns.fail(&session, &err);
                return Err(err);
            }
        };

        if !self.start(&session, response) {
            return Err(ManagerError::Cancelled);
        }
        tracing::info!(id, "Event stream open");
        Ok(())
    }

    async fn send(&self, id: &str, _payload: OutboundPayload) -> Result<(), ManagerError> {
        self.conns.control(id)?;
        Err(ManagerError::unsupported(Protocol::Sse, "send"))
    }

    async fn disconnect(&self, id: &str) {
        if let Some(entry) = self.conns.detach(id) {
            tracing::info!(id, "Closing event stream");
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

async fn run_stream(conns: Connections<()>, session: Arc<Session>, response: reqwest::Response) {
    let mut parser = FrameParser::new();
    let mut body = response.bytes_stream();

    loop {
        tokio::select! {
            biased;

            _ = session.cancel_token().cancelled() => {
                session.emit_marker(MessageBody::Disconnected { reason: None });
                return;
            }

            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    for frame in parser.feed(&bytes) {
                        session.emit_message(Direction::Received, MessageBody::Event(frame));
                    }
                }
                Some(Err(e)) => {
                    let err = ManagerError::Transport(format!("Stream error: {}", e));
                    session.emit_message(Direction::System, MessageBody::Error { message: err.to_string() });
                    conns.fail(&session, &err);
                    return;
                }
                None => {
                    tracing::info!(id = %session.id(), buffered = parser.buffered_len(), "Event stream ended");
                    session.emit_message(Direction::System, MessageBody::Disconnected { reason: None });
                    conns.closed_by_remote(&session, None);
                    return;
                }
            }
        }
    }
}
