//! Network actor - owns every protocol manager and answers boundary calls

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::messages::{Call, NetworkCommand, Reply};
use crate::models::{ConnectOptions, Protocol};
use crate::network::event_stream::SseManager;
use crate::network::grpc::GrpcManager;
use crate::network::http::HttpManager;
use crate::network::lifecycle::{ConnectionManager, EventSink};
use crate::network::socketio::SocketIoManager;
use crate::network::websocket::WebSocketManager;

/// One manager per protocol
pub struct Managers {
    pub http: HttpManager,
    pub websocket: WebSocketManager,
    pub sse: SseManager,
    pub socketio: SocketIoManager,
    pub grpc: GrpcManager,
}

impl Managers {
    pub fn new(config: &Config, events: EventSink) -> Self {
        Managers {
            http: HttpManager::new(config),
            websocket: WebSocketManager::new(config, events.clone()),
            sse: SseManager::new(config, events.clone()),
            socketio: SocketIoManager::new(config, events.clone()),
            grpc: GrpcManager::new(config, events),
        }
    }

    /// The manager that speaks `protocol`
    pub fn manager(&self, protocol: Protocol) -> &dyn ConnectionManager {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::WebSocket => &self.websocket,
            Protocol::Sse => &self.sse,
            Protocol::SocketIo => &self.socketio,
            Protocol::Grpc => &self.grpc,
        }
    }

    /// Run one call to completion
    pub async fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::Connect {
                connection_id,
                options,
            } => {
                let manager = self.manager(options.protocol());
                Reply::ack(manager.connect(&connection_id, options).await)
            }
            Call::Send {
                protocol,
                connection_id,
                payload,
            } => Reply::ack(self.manager(protocol).send(&connection_id, payload).await),
            Call::Disconnect {
                protocol,
                connection_id,
            } => {
                self.manager(protocol).disconnect(&connection_id).await;
                Reply::ack(Ok(()))
            }
            Call::Status {
                protocol,
                connection_id,
            } => Reply::status(self.manager(protocol).status(&connection_id)),
            Call::Request {
                request_id,
                options,
            } => Reply::http(self.http.request(&request_id, options).await),
            Call::Cancel { request_id } => Reply::Cancelled {
                cancelled: self.http.cancel(&request_id) || self.grpc.cancel(&request_id),
            },
            Call::Invoke {
                request_id,
                options,
            } => Reply::rpc(self.grpc.invoke(&request_id, options).await),
            Call::Stream {
                connection_id,
                options,
            } => Reply::ack(
                self.grpc
                    .connect(&connection_id, ConnectOptions::Grpc(options))
                    .await,
            ),
            Call::CancelStream { connection_id } => {
                self.grpc.disconnect(&connection_id).await;
                Reply::ack(Ok(()))
            }
            Call::Describe { proto } => Reply::describe(self.grpc.describe(&proto).await),
            Call::Shutdown => {
                self.shutdown().await;
                Reply::ack(Ok(()))
            }
        }
    }

    /// Close every connection and abort every in-flight request
    pub async fn shutdown(&self) {
        tokio::join!(
            self.http.shutdown(),
            self.websocket.shutdown(),
            self.sse.shutdown(),
            self.socketio.shutdown(),
            self.grpc.shutdown(),
        );
    }
}

/// Network actor that processes boundary calls
pub struct NetworkActor {
    managers: Arc<Managers>,
    active_calls: JoinSet<()>,
}

impl NetworkActor {
    pub fn new(config: &Config, events: EventSink) -> Self {
        NetworkActor {
            managers: Arc::new(Managers::new(config, events)),
            active_calls: JoinSet::new(),
        }
    }

    pub fn manager(&self, protocol: Protocol) -> &dyn ConnectionManager {
        self.managers.manager(protocol)
    }

    /// Run the network actor message loop until `Shutdown` or every sender is gone
    pub async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<NetworkCommand>) {
        loop {
            tokio::select! {
                biased;

                // Handle incoming calls
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NetworkCommand { call: Call::Shutdown, reply_tx }) => {
                            self.shutdown().await;
                            let _ = reply_tx.send(Reply::ack(Ok(())));
                            break;
                        }

                        // Every other call runs on its own task so a slow
                        // handshake never holds up other connections
                        Some(NetworkCommand { call, reply_tx }) => {
                            let managers = Arc::clone(&self.managers);
                            self.active_calls.spawn(async move {
                                let reply = managers.dispatch(call).await;
                                let _ = reply_tx.send(reply);
                            });
                        }

                        None => {
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                // Clean up completed tasks
                Some(result) = self.active_calls.join_next() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Call task panicked");
                        }
                    }
                }
            }
        }
        tracing::info!("Network actor stopped");
    }

    async fn shutdown(&mut self) {
        tracing::info!(active_calls = self.active_calls.len(), "Shutting down network layer");
        self.managers.shutdown().await;
        self.active_calls.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::messages::{EventKind, ManagerEvent};
    use crate::models::{HttpRequestOptions, OutboundPayload, WebSocketOptions};
    use crate::network::lifecycle::ConnectionStatus;
    use crate::network::testutil::{next_of_kind, sink, spawn_http, spawn_ws_echo};
    use axum::routing::get;
    use axum::Router;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct Harness {
        cmd_tx: mpsc::UnboundedSender<NetworkCommand>,
        events: mpsc::UnboundedReceiver<ManagerEvent>,
        actor: JoinHandle<()>,
    }

    fn start() -> Harness {
        let (events_tx, events) = sink();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = tokio::spawn(NetworkActor::new(&Config::default(), events_tx).run(cmd_rx));
        Harness {
            cmd_tx,
            events,
            actor,
        }
    }

    async fn call(harness: &Harness, call: Call) -> Reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        harness
            .cmd_tx
            .send(NetworkCommand { call, reply_tx })
            .unwrap();
        reply_rx.await.unwrap()
    }

    fn ack_error(reply: Reply) -> ErrorKind {
        match reply {
            Reply::Ack {
                success: false,
                error: Some(e),
            } => e.kind,
            other => panic!("expected failed ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_of_unknown_connection() {
        let harness = start();
        let reply = call(
            &harness,
            Call::Status {
                protocol: Protocol::WebSocket,
                connection_id: "nope".into(),
            },
        )
        .await;
        match reply {
            Reply::Status { status, info } => {
                assert_eq!(status, ConnectionStatus::Disconnected);
                assert_eq!(info.protocol, Protocol::WebSocket);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_and_cancel_unknown() {
        let addr = spawn_http(Router::new().route("/", get(|| async { "pong" }))).await;
        let harness = start();

        let reply = call(
            &harness,
            Call::Request {
                request_id: "r1".into(),
                options: HttpRequestOptions {
                    url: format!("http://{}/", addr),
                    ..Default::default()
                },
            },
        )
        .await;
        match reply {
            Reply::Http {
                success: true,
                response: Some(response),
                ..
            } => assert_eq!(response.body.as_deref(), Some("pong")),
            other => panic!("unexpected reply {:?}", other),
        }

        let reply = call(&harness, Call::Cancel { request_id: "r1".into() }).await;
        assert_eq!(reply, Reply::Cancelled { cancelled: false });
    }

    #[tokio::test]
    async fn test_lifecycle_verbs_route_by_protocol() {
        let harness = start();
        let reply = call(
            &harness,
            Call::Send {
                protocol: Protocol::Http,
                connection_id: "x".into(),
                payload: OutboundPayload::Text { data: "a".into() },
            },
        )
        .await;
        assert_eq!(ack_error(reply), ErrorKind::UnsupportedOperation);

        let reply = call(
            &harness,
            Call::Send {
                protocol: Protocol::WebSocket,
                connection_id: "x".into(),
                payload: OutboundPayload::Text { data: "a".into() },
            },
        )
        .await;
        assert_eq!(ack_error(reply), ErrorKind::ConnectionNotFound);

        let reply = call(
            &harness,
            Call::Disconnect {
                protocol: Protocol::Sse,
                connection_id: "x".into(),
            },
        )
        .await;
        assert_eq!(reply, Reply::ack(Ok(())));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_stops() {
        let addr = spawn_ws_echo().await;
        let mut harness = start();

        let reply = call(
            &harness,
            Call::Connect {
                connection_id: "ws".into(),
                options: ConnectOptions::WebSocket(WebSocketOptions {
                    url: format!("ws://{}", addr),
                    ..Default::default()
                }),
            },
        )
        .await;
        assert_eq!(reply, Reply::ack(Ok(())));

        let reply = call(&harness, Call::Shutdown).await;
        assert_eq!(reply, Reply::ack(Ok(())));
        let event = next_of_kind(&mut harness.events, EventKind::Disconnected).await;
        assert_eq!(event.connection_id, "ws");

        tokio::time::timeout(std::time::Duration::from_secs(2), &mut harness.actor)
            .await
            .unwrap()
            .unwrap();
    }
}
