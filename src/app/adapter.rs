//! Presentation-side adapters over the network boundary
//!
//! Each adapter turns boundary calls into plain async methods and exposes the
//! connection's topics for subscription. Adapters hold no network state:
//! dropping one leaves its connection alone, and dropping a [`Subscription`]
//! only unsubscribes.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{ErrorKind, ErrorPayload};
use crate::messages::network::ServiceInfo;
use crate::messages::{Call, EventKind, HttpResponse, NetworkCommand, Reply, RpcResponse};
use crate::models::{ConnectOptions, GrpcCallOptions, HttpRequestOptions, OutboundPayload, Protocol};
use crate::network::{ConnectionInfo, EventForwarder, NetworkActor, Subscription};

pub type AdapterResult<T> = Result<T, ErrorPayload>;

fn not_running() -> ErrorPayload {
    ErrorPayload::new(ErrorKind::TransportError, "network layer is not running")
}

fn unexpected(reply: Reply) -> ErrorPayload {
    ErrorPayload::new(
        ErrorKind::TransportError,
        format!("unexpected reply: {:?}", reply),
    )
}

fn ack(reply: Reply) -> AdapterResult<()> {
    match reply {
        Reply::Ack { success: true, .. } => Ok(()),
        Reply::Ack {
            error: Some(error), ..
        } => Err(error),
        other => Err(unexpected(other)),
    }
}

/// Handle on a running network layer: a call channel plus the event forwarder
#[derive(Clone)]
pub struct Boundary {
    cmd_tx: mpsc::UnboundedSender<NetworkCommand>,
    forwarder: EventForwarder,
}

impl Boundary {
    pub fn new(cmd_tx: mpsc::UnboundedSender<NetworkCommand>, forwarder: EventForwarder) -> Self {
        Boundary { cmd_tx, forwarder }
    }

    /// Start the forwarder and network actor on the current runtime
    pub fn spawn(config: &Config) -> (Self, JoinHandle<()>) {
        let forwarder = EventForwarder::new(config.topic_capacity);
        let sink = forwarder.start();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = tokio::spawn(NetworkActor::new(config, sink).run(cmd_rx));
        (Boundary::new(cmd_tx, forwarder), actor)
    }

    /// Issue one call and wait for its reply
    pub async fn call(&self, call: Call) -> AdapterResult<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand { call, reply_tx })
            .map_err(|_| not_running())?;
        reply_rx.await.map_err(|_| not_running())
    }

    pub fn subscribe(&self, kind: EventKind, connection_id: &str) -> Subscription {
        self.forwarder.subscribe(kind, connection_id)
    }

    pub fn forwarder(&self) -> &EventForwarder {
        &self.forwarder
    }

    pub fn websocket(&self, connection_id: impl Into<String>) -> ConnectionAdapter {
        ConnectionAdapter::new(self.clone(), Protocol::WebSocket, connection_id)
    }

    pub fn sse(&self, connection_id: impl Into<String>) -> ConnectionAdapter {
        ConnectionAdapter::new(self.clone(), Protocol::Sse, connection_id)
    }

    pub fn socketio(&self, connection_id: impl Into<String>) -> ConnectionAdapter {
        ConnectionAdapter::new(self.clone(), Protocol::SocketIo, connection_id)
    }

    pub fn http(&self) -> HttpAdapter {
        HttpAdapter {
            boundary: self.clone(),
        }
    }

    pub fn rpc(&self) -> RpcAdapter {
        RpcAdapter {
            boundary: self.clone(),
        }
    }

    /// Close every connection and stop the network actor
    pub async fn shutdown(&self) -> AdapterResult<()> {
        ack(self.call(Call::Shutdown).await?)
    }
}

/// One persistent connection (WebSocket, event stream or Socket.IO)
pub struct ConnectionAdapter {
    boundary: Boundary,
    protocol: Protocol,
    connection_id: String,
}

impl ConnectionAdapter {
    fn new(boundary: Boundary, protocol: Protocol, connection_id: impl Into<String>) -> Self {
        ConnectionAdapter {
            boundary,
            protocol,
            connection_id: connection_id.into(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub async fn connect(&self, options: ConnectOptions) -> AdapterResult<()> {
        if options.protocol() != self.protocol {
            return Err(ErrorPayload::new(
                ErrorKind::InvalidOptions,
                format!("{} options given to a {} connection", options.protocol(), self.protocol),
            ));
        }
        ack(self
            .boundary
            .call(Call::Connect {
                connection_id: self.connection_id.clone(),
                options,
            })
            .await?)
    }

    pub async fn send(&self, payload: OutboundPayload) -> AdapterResult<()> {
        ack(self
            .boundary
            .call(Call::Send {
                protocol: self.protocol,
                connection_id: self.connection_id.clone(),
                payload,
            })
            .await?)
    }

    pub async fn send_text(&self, data: impl Into<String>) -> AdapterResult<()> {
        self.send(OutboundPayload::Text { data: data.into() }).await
    }

    /// Emit a named event (Socket.IO)
    pub async fn emit(
        &self,
        event: impl Into<String>,
        args: Vec<serde_json::Value>,
    ) -> AdapterResult<()> {
        self.send(OutboundPayload::Event {
            event: event.into(),
            args,
        })
        .await
    }

    pub async fn disconnect(&self) -> AdapterResult<()> {
        ack(self
            .boundary
            .call(Call::Disconnect {
                protocol: self.protocol,
                connection_id: self.connection_id.clone(),
            })
            .await?)
    }

    pub async fn status(&self) -> AdapterResult<ConnectionInfo> {
        match self
            .boundary
            .call(Call::Status {
                protocol: self.protocol,
                connection_id: self.connection_id.clone(),
            })
            .await?
        {
            Reply::Status { info, .. } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        self.boundary.subscribe(kind, &self.connection_id)
    }
}

/// One-shot HTTP requests
pub struct HttpAdapter {
    boundary: Boundary,
}

impl HttpAdapter {
    pub async fn request(
        &self,
        request_id: impl Into<String>,
        options: HttpRequestOptions,
    ) -> AdapterResult<HttpResponse> {
        match self
            .boundary
            .call(Call::Request {
                request_id: request_id.into(),
                options,
            })
            .await?
        {
            Reply::Http {
                response: Some(response),
                ..
            } => Ok(response),
            Reply::Http {
                error: Some(error), ..
            } => Err(error),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, request_id: impl Into<String>) -> AdapterResult<bool> {
        cancel(&self.boundary, request_id.into()).await
    }
}

async fn cancel(boundary: &Boundary, request_id: String) -> AdapterResult<bool> {
    match boundary.call(Call::Cancel { request_id }).await? {
        Reply::Cancelled { cancelled } => Ok(cancelled),
        other => Err(unexpected(other)),
    }
}

/// Unary and server-streaming RPC
pub struct RpcAdapter {
    boundary: Boundary,
}

impl RpcAdapter {
    pub async fn invoke(
        &self,
        request_id: impl Into<String>,
        options: GrpcCallOptions,
    ) -> AdapterResult<RpcResponse> {
        match self
            .boundary
            .call(Call::Invoke {
                request_id: request_id.into(),
                options,
            })
            .await?
        {
            Reply::Rpc {
                response: Some(response),
                ..
            } => Ok(response),
            Reply::Rpc {
                error: Some(error), ..
            } => Err(error),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, request_id: impl Into<String>) -> AdapterResult<bool> {
        cancel(&self.boundary, request_id.into()).await
    }

    /// Start a server-streaming call; results arrive on `data:`, `status:` and `end:`
    pub async fn stream(
        &self,
        connection_id: impl Into<String>,
        options: GrpcCallOptions,
    ) -> AdapterResult<()> {
        ack(self
            .boundary
            .call(Call::Stream {
                connection_id: connection_id.into(),
                options,
            })
            .await?)
    }

    pub async fn cancel_stream(&self, connection_id: impl Into<String>) -> AdapterResult<()> {
        ack(self
            .boundary
            .call(Call::CancelStream {
                connection_id: connection_id.into(),
            })
            .await?)
    }

    pub async fn describe(&self, proto: impl Into<String>) -> AdapterResult<Vec<ServiceInfo>> {
        match self
            .boundary
            .call(Call::Describe {
                proto: proto.into(),
            })
            .await?
        {
            Reply::Describe {
                services: Some(services),
                ..
            } => Ok(services),
            Reply::Describe {
                error: Some(error), ..
            } => Err(error),
            other => Err(unexpected(other)),
        }
    }

    pub fn subscribe(&self, kind: EventKind, connection_id: &str) -> Subscription {
        self.boundary.subscribe(kind, connection_id)
    }
}
