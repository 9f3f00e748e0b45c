//! Local servers and event helpers for manager tests

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, MethodDescriptor};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tonic::body::BoxBody;
use tonic::codegen::{http, Body as GrpcBody, BoxFuture, BoxStream, Service, StdError};
use tonic::server::{NamedService, ServerStreamingService, UnaryService};
use tonic::transport::server::TcpIncoming;
use tonic::Status;

use crate::messages::{EventKind, ManagerEvent};
use crate::network::grpc::DynamicCodec;
use crate::network::lifecycle::EventSink;

/// Serve `app` on an ephemeral localhost port
pub async fn spawn_http(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An event-stream response that sends `chunks` and then stays open
pub fn event_stream_body(chunks: Vec<&'static str>) -> Response {
    let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>))
        .chain(futures_util::stream::pending());
    (
        [("content-type", "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// An event-stream response that sends `chunks` and then ends
pub fn finite_event_stream(chunks: Vec<&'static str>) -> Response {
    let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
    (
        [("content-type", "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// WebSocket server that echoes every data frame and accepts the first offered subprotocol.
/// A text frame `close-me` makes the server close with code 4000.
pub async fn spawn_ws_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let callback = |req: &Request, mut resp: WsResponse| {
                    if let Some(offered) = req.headers().get("sec-websocket-protocol") {
                        let first = offered
                            .to_str()
                            .unwrap_or("")
                            .split(',')
                            .next()
                            .unwrap_or("")
                            .trim()
                            .to_string();
                        resp.headers_mut()
                            .insert("sec-websocket-protocol", first.parse().unwrap());
                    }
                    if let Some(token) = req.headers().get("x-token") {
                        resp.headers_mut().insert("x-token-echo", token.clone());
                    }
                    Ok::<_, ErrorResponse>(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        WsMessage::Text(text) if text == "close-me" => {
                            let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                code: 4000.into(),
                                reason: "bye".into(),
                            };
                            let _ = ws.close(Some(frame)).await;
                        }
                        WsMessage::Text(_) | WsMessage::Binary(_) => {
                            if ws.send(msg).await.is_err() {
                                break;
                            }
                        }
                        WsMessage::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    addr
}

/// Socket.IO server speaking just enough Engine.IO v4 over a plain websocket.
/// `echo` events come back unchanged and `kick` makes the server drop the namespace.
/// Every Socket.IO packet the server receives is forwarded on the returned channel.
pub async fn spawn_socketio() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen = seen_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let open = r#"0{"sid":"eio-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;
                if ws.send(WsMessage::Text(open.to_string())).await.is_err() {
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    let text = match msg {
                        WsMessage::Text(text) => text,
                        WsMessage::Close(_) => break,
                        _ => continue,
                    };
                    // Engine.IO message packets carry one Socket.IO packet
                    let Some(packet) = text.strip_prefix('4') else {
                        continue;
                    };
                    let _ = seen.send(packet.to_string());

                    let reply = if packet.starts_with('0') {
                        Some(String::from(r#"40{"sid":"io-1"}"#))
                    } else if let Some(body) = packet.strip_prefix('2') {
                        match serde_json::from_str::<Vec<Value>>(body) {
                            Ok(parts) if parts.first() == Some(&json!("echo")) => {
                                Some(format!("42{}", Value::Array(parts)))
                            }
                            Ok(parts) if parts.first() == Some(&json!("kick")) => {
                                Some(String::from("41"))
                            }
                            _ => None,
                        }
                    } else {
                        None
                    };
                    if let Some(reply) = reply {
                        if ws.send(WsMessage::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                }
            });
        }
    });
    (addr, seen_rx)
}

fn text_field(message: &DynamicMessage) -> String {
    message
        .get_field_by_name("text")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn echo_reply(output: &MessageDescriptor, text: String) -> DynamicMessage {
    let mut reply = DynamicMessage::new(output.clone());
    reply.set_field_by_name("text", prost_reflect::Value::String(text));
    reply
}

struct Say(MessageDescriptor);

impl UnaryService<DynamicMessage> for Say {
    type Response = DynamicMessage;
    type Future = BoxFuture<tonic::Response<DynamicMessage>, Status>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let output = self.0.clone();
        Box::pin(async move {
            let text = text_field(request.get_ref());
            if text == "fail" {
                return Err(Status::not_found("nothing to say"));
            }
            let trace = request.metadata().get("x-trace").cloned();
            let mut response = tonic::Response::new(echo_reply(&output, text));
            if let Some(trace) = trace {
                response.metadata_mut().insert("x-trace-echo", trace);
            }
            Ok(response)
        })
    }
}

struct Repeat(MessageDescriptor);

impl ServerStreamingService<DynamicMessage> for Repeat {
    type Response = DynamicMessage;
    type ResponseStream = BoxStream<DynamicMessage>;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<DynamicMessage>) -> Self::Future {
        let output = self.0.clone();
        Box::pin(async move {
            let text = text_field(request.get_ref());
            let times = request
                .get_ref()
                .get_field_by_name("times")
                .and_then(|v| v.as_i32())
                .unwrap_or(0);
            let replies: Vec<Result<DynamicMessage, Status>> = (0..times.max(1))
                .map(|i| Ok(echo_reply(&output, format!("{}-{}", text, i))))
                .collect();
            let replies = futures_util::stream::iter(replies);
            // times == 0: one reply, then the stream stays open
            let stream: BoxStream<DynamicMessage> = if times > 0 {
                Box::pin(replies)
            } else {
                Box::pin(replies.chain(futures_util::stream::pending()))
            };
            Ok(tonic::Response::new(stream))
        })
    }
}

/// `demo.v1.Echo` served from a descriptor pool; `Say` and `Repeat` only
#[derive(Clone)]
struct EchoServer {
    say: MethodDescriptor,
    repeat: MethodDescriptor,
}

impl NamedService for EchoServer {
    const NAME: &'static str = "demo.v1.Echo";
}

impl<B> Service<http::Request<B>> for EchoServer
where
    B: GrpcBody + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let say = self.say.clone();
        let repeat = self.repeat.clone();
        Box::pin(async move {
            let path = req.uri().path().to_string();
            let response = match path.as_str() {
                "/demo.v1.Echo/Say" => {
                    let mut grpc = tonic::server::Grpc::new(DynamicCodec::new(say.input()));
                    grpc.unary(Say(say.output()), req).await
                }
                "/demo.v1.Echo/Repeat" => {
                    let mut grpc = tonic::server::Grpc::new(DynamicCodec::new(repeat.input()));
                    grpc.server_streaming(Repeat(repeat.output()), req).await
                }
                _ => Status::unimplemented(path).into_http(),
            };
            Ok(response)
        })
    }
}

/// Serve the `demo.v1.Echo` service described by `pool` on an ephemeral port
pub async fn spawn_grpc_echo(pool: &DescriptorPool) -> SocketAddr {
    let service = pool.get_service_by_name("demo.v1.Echo").unwrap();
    let method = |name: &str| service.methods().find(|m| m.name() == name).unwrap();
    let server = EchoServer {
        say: method("Say"),
        repeat: method("Repeat"),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let incoming = TcpIncoming::from_listener(listener, true, None).unwrap();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(server)
            .serve_with_incoming(incoming)
            .await
            .unwrap();
    });
    addr
}

pub fn sink() -> (EventSink, mpsc::UnboundedReceiver<ManagerEvent>) {
    mpsc::unbounded_channel()
}

/// Wait for the next event, failing the test after two seconds
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event sink closed")
}

/// Skip events until one of `kind` arrives
pub async fn next_of_kind(
    rx: &mut mpsc::UnboundedReceiver<ManagerEvent>,
    kind: EventKind,
) -> ManagerEvent {
    loop {
        let event = next_event(rx).await;
        if event.kind() == kind {
            return event;
        }
    }
}

/// Let in-flight deliveries land, then return whatever arrived
pub async fn settle(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
