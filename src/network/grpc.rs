//! RPC manager - unary and server-streaming gRPC calls against a schema
//! supplied as proto text, with messages built from JSON at run time.

use async_trait::async_trait;
use prost::Message as _;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Status, Streaming};

use crate::config::Config;
use crate::error::ManagerError;
use crate::messages::network::{RpcResponse, ServiceInfo};
use crate::messages::{EventPayload, RpcStatus};
use crate::models::{enabled_headers, ConnectOptions, GrpcCallOptions, OutboundPayload, Protocol};
use crate::network::lifecycle::{ConnectionInfo, ConnectionManager, Connections, EventSink, Session};
use crate::network::registry::{CallToken, InFlight, Registry};
use crate::network::schema::{self, CallMode};

/// Flatten gRPC metadata into plain strings; binary values stay base64
pub fn metadata_to_map(metadata: &MetadataMap) -> BTreeMap<String, String> {
    metadata
        .clone()
        .into_headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Codec for messages whose type is only known from a descriptor
#[derive(Clone)]
pub struct DynamicCodec {
    output: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(output: MessageDescriptor) -> Self {
        DynamicCodec { output }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.output.clone())
    }
}

pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("encoding request: {}", e)))
    }
}

pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        DynamicMessage::decode(self.0.clone(), src)
            .map(Some)
            .map_err(|e| Status::internal(format!("decoding response: {}", e)))
    }
}

/// Everything a call needs once the schema has been resolved
struct PreparedCall {
    method: MethodDescriptor,
    path: PathAndQuery,
    request: tonic::Request<DynamicMessage>,
}

fn to_json(message: &DynamicMessage) -> Result<serde_json::Value, ManagerError> {
    serde_json::to_value(message)
        .map_err(|e| ManagerError::Transport(format!("converting response: {}", e)))
}

fn build_message(
    method: &MethodDescriptor,
    json: &serde_json::Value,
) -> Result<DynamicMessage, ManagerError> {
    if json.is_null() {
        return Ok(DynamicMessage::new(method.input()));
    }
    DynamicMessage::deserialize(method.input(), json.clone()).map_err(|e| {
        ManagerError::InvalidOptions(format!(
            "message does not match {}: {}",
            method.input().full_name(),
            e
        ))
    })
}

fn apply_metadata(
    request: &mut tonic::Request<DynamicMessage>,
    options: &GrpcCallOptions,
) -> Result<(), ManagerError> {
    for header in enabled_headers(&options.metadata) {
        let key = AsciiMetadataKey::from_bytes(header.key.trim().to_ascii_lowercase().as_bytes())
            .map_err(|e| ManagerError::InvalidOptions(format!("metadata key {}: {}", header.key, e)))?;
        let value: AsciiMetadataValue = header.value.parse().map_err(|e| {
            ManagerError::InvalidOptions(format!("metadata value for {}: {}", header.key, e))
        })?;
        request.metadata_mut().append(key, value);
    }
    Ok(())
}

pub struct GrpcManager {
    conns: Connections<()>,
    in_flight: Registry<CallToken>,
    scratch_root: PathBuf,
    default_timeout: Duration,
    connect_timeout: Duration,
}

impl GrpcManager {
    pub fn new(config: &Config, events: EventSink) -> Self {
        GrpcManager {
            conns: Connections::new(Protocol::Grpc, events, config.disconnect_grace()),
            in_flight: Registry::new(),
            scratch_root: config.scratch_root(),
            default_timeout: config.rpc_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }

    /// Compile the schema and list its services
    pub async fn describe(&self, proto: &str) -> Result<Vec<ServiceInfo>, ManagerError> {
        let pool = schema::compile(proto, &self.scratch_root).await?;
        Ok(schema::describe(&pool))
    }

    /// Unary call. A non-OK status is a response, not an error.
    pub async fn invoke(
        &self,
        request_id: &str,
        options: GrpcCallOptions,
    ) -> Result<RpcResponse, ManagerError> {
        let call = InFlight::register(&self.in_flight, request_id)?;
        let token = call.token();

        tracing::info!(request_id, url = %options.url, service = %options.service, method = %options.method, "Invoking RPC");
        let result = tokio::select! {
            biased;

            _ = token.cancelled() => Err(ManagerError::Cancelled),
            result = self.unary(&options) => result,
        };

        match &result {
            Ok(resp) => tracing::info!(request_id, code = resp.status.code, time_ms = resp.time_ms, "RPC completed"),
            Err(e) => tracing::info!(request_id, error = %e, "RPC failed"),
        }
        result
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        match self.in_flight.lookup(request_id) {
            Some(token) => {
                tracing::info!(request_id, "Cancelling RPC");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn prepare(
        &self,
        options: &GrpcCallOptions,
        expected: CallMode,
    ) -> Result<PreparedCall, ManagerError> {
        let pool = schema::compile(&options.proto, &self.scratch_root).await?;
        let service = schema::resolve_service(&pool, &options.service)?;
        let method = schema::resolve_method(&service, &options.method)?;

        match (CallMode::of(&method), expected) {
            (mode, expected) if mode == expected => {}
            (CallMode::ClientStreaming | CallMode::Bidirectional, _) => {
                return Err(ManagerError::unsupported(Protocol::Grpc, "client streaming"));
            }
            (CallMode::ServerStreaming, _) => {
                return Err(ManagerError::unsupported(
                    Protocol::Grpc,
                    "invoking a server-streaming method",
                ));
            }
            (CallMode::Unary, _) => {
                return Err(ManagerError::unsupported(
                    Protocol::Grpc,
                    "streaming a unary method",
                ));
            }
        }

        let path = format!("/{}/{}", service.full_name(), method.name())
            .parse::<PathAndQuery>()
            .map_err(|e| ManagerError::Schema(format!("method path: {}", e)))?;

        let mut request = tonic::Request::new(build_message(&method, &options.message)?);
        apply_metadata(&mut request, options)?;

        Ok(PreparedCall {
            method,
            path,
            request,
        })
    }

    async fn channel(&self, url: &str) -> Result<Channel, ManagerError> {
        let url = url.trim();
        let mut endpoint = Endpoint::from_shared(url.to_string())
            .map_err(|e| ManagerError::InvalidOptions(format!("{}: {}", url, e)))?
            .connect_timeout(self.connect_timeout);
        if url.starts_with("https://") {
            endpoint = endpoint
                .tls_config(ClientTlsConfig::new().with_native_roots())
                .map_err(|e| ManagerError::Transport(format!("TLS setup failed: {}", e)))?;
        }
        endpoint
            .connect()
            .await
            .map_err(|e| ManagerError::Transport(format!("Connection failed: {}", e)))
    }

    async fn client(&self, url: &str) -> Result<tonic::client::Grpc<Channel>, ManagerError> {
        let mut grpc = tonic::client::Grpc::new(self.channel(url).await?);
        grpc.ready()
            .await
            .map_err(|e| ManagerError::Transport(format!("Service not ready: {}", e)))?;
        Ok(grpc)
    }

    async fn unary(&self, options: &GrpcCallOptions) -> Result<RpcResponse, ManagerError> {
        let start = Instant::now();
        let mut call = self.prepare(options, CallMode::Unary).await?;
        call.request.set_timeout(
            options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout),
        );

        let mut grpc = self.client(&options.url).await?;
        let codec = DynamicCodec::new(call.method.output());
        let result = grpc.unary(call.request, call.path, codec).await;
        let time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let metadata = metadata_to_map(response.metadata());
                let message = to_json(response.get_ref())?;
                Ok(RpcResponse {
                    ok: true,
                    message: Some(message),
                    status: RpcStatus::ok(metadata),
                    time_ms,
                })
            }
            Err(status) => Ok(RpcResponse {
                ok: false,
                message: None,
                status: RpcStatus::from_status(&status),
                time_ms,
            }),
        }
    }

    async fn open_stream(
        &self,
        call: PreparedCall,
        url: &str,
    ) -> Result<Result<tonic::Response<Streaming<DynamicMessage>>, Status>, ManagerError> {
        let mut grpc = self.client(url).await?;
        let codec = DynamicCodec::new(call.method.output());
        Ok(grpc.server_streaming(call.request, call.path, codec).await)
    }
}

#[async_trait]
impl ConnectionManager for GrpcManager {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
    }

    /// Start a server-streaming call under `id`
    async fn connect(&self, id: &str, options: ConnectOptions) -> Result<(), ManagerError> {
        let ConnectOptions::Grpc(options) = options else {
            return Err(ManagerError::InvalidOptions(String::from("expected rpc options")));
        };
        let call = self.prepare(&options, CallMode::ServerStreaming).await?;
        let session = self.conns.reserve(id, &options.url)?;
        tracing::info!(id, url = %options.url, service = %options.service, method = %options.method, "Opening RPC stream");

        let result = tokio::select! {
            biased;

            _ = session.cancel_token().cancelled() => return Err(ManagerError::Cancelled),
            result = self.open_stream(call, &options.url) => result,
        };

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(status)) => {
                session.emit(EventPayload::Status(RpcStatus::from_status(&status)));
                let err = ManagerError::Transport(format!("{:?}: {}", status.code(), status.message()));
                self.conns.fail(&session, &err);
                return Err(err);
            }
            Err(err) => {
                self.conns.fail(&session, &err);
                return Err(err);
            }
        };

        let headers = metadata_to_map(response.metadata());
        let conns = self.conns.clone();
        let loop_session = Arc::clone(&session);
        let stream = response.into_inner();
        let spawn = move || tokio::spawn(run_stream(conns, loop_session, stream, headers));
        if !self.conns.attach(&session, (), spawn) {
            return Err(ManagerError::Cancelled);
        }
        Ok(())
    }

    async fn send(&self, _id: &str, _payload: OutboundPayload) -> Result<(), ManagerError> {
        Err(ManagerError::unsupported(Protocol::Grpc, "send"))
    }

    /// Cancel a stream started with `connect`
    async fn disconnect(&self, id: &str) {
        if let Some(entry) = self.conns.detach(id) {
            tracing::info!(id, "Cancelling RPC stream");
            self.conns.finish(entry, None).await;
        }
    }

    fn status(&self, id: &str) -> ConnectionInfo {
        self.conns.info(id)
    }

    async fn shutdown(&self) {
        for (id, token) in self.in_flight.remove_all() {
            tracing::info!(request_id = %id, "Cancelling RPC for shutdown");
            token.cancel();
        }
        let entries = self.conns.detach_all();
        futures_util::future::join_all(
            entries
                .into_iter()
                .map(|entry| self.conns.finish(entry, None)),
        )
        .await;
    }
}

async fn run_stream(
    conns: Connections<()>,
    session: Arc<Session>,
    mut stream: Streaming<DynamicMessage>,
    mut metadata: BTreeMap<String, String>,
) {
    loop {
        tokio::select! {
            biased;

            _ = session.cancel_token().cancelled() => return,

            message = stream.message() => match message {
                Ok(Some(message)) => match to_json(&message) {
                    Ok(json) => session.emit(EventPayload::Data(json)),
                    Err(err) => {
                        conns.fail(&session, &err);
                        return;
                    }
                },
                Ok(None) => {
                    if let Ok(Some(trailers)) = stream.trailers().await {
                        metadata.extend(metadata_to_map(&trailers));
                    }
                    tracing::info!(id = %session.id(), "RPC stream completed");
                    session.emit(EventPayload::Status(RpcStatus::ok(metadata)));
                    session.emit(EventPayload::End);
                    conns.closed_by_remote(&session, None);
                    return;
                }
                Err(status) => {
                    session.emit(EventPayload::Status(RpcStatus::from_status(&status)));
                    let err = ManagerError::Transport(format!("{:?}: {}", status.code(), status.message()));
                    conns.fail(&session, &err);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::messages::EventKind;
    use crate::models::Header;
    use crate::network::lifecycle::ConnectionStatus;
    use crate::network::schema::tests::ECHO_PROTO;
    use crate::network::testutil::{next_event, settle, sink, spawn_grpc_echo};
    use serde_json::json;

    async fn live_server(scratch: &std::path::Path) -> String {
        let pool = schema::compile(ECHO_PROTO, scratch).await.unwrap();
        format!("http://{}", spawn_grpc_echo(&pool).await)
    }

    fn manager(scratch: &std::path::Path) -> (GrpcManager, tokio::sync::mpsc::UnboundedReceiver<crate::messages::ManagerEvent>) {
        let config = Config {
            scratch_dir: Some(scratch.to_path_buf()),
            connect_timeout_ms: 500,
            ..Config::default()
        };
        let (tx, rx) = sink();
        (GrpcManager::new(&config, tx), rx)
    }

    fn options(service: &str, method: &str) -> GrpcCallOptions {
        GrpcCallOptions {
            url: String::from("http://127.0.0.1:1"),
            proto: ECHO_PROTO.to_string(),
            service: service.to_string(),
            method: method.to_string(),
            message: json!({"text": "hi", "times": 2}),
            metadata: vec![Header::new("x-trace", "abc")],
            timeout_ms: Some(500),
        }
    }

    #[tokio::test]
    async fn test_missing_service_is_schema_error_and_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(scratch.path());

        let err = manager.invoke("r1", options("Nope", "Say")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
        assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_proto_is_schema_error() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(scratch.path());
        let mut opts = options("Echo", "Say");
        opts.proto = String::from("service {");

        let err = manager.invoke("r1", opts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
        assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_call_mode_must_match_method() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(scratch.path());

        let err = manager.invoke("r1", options("Echo", "Repeat")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

        let err = manager
            .connect("s1", ConnectOptions::Grpc(options("Echo", "Say")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

        let err = manager
            .connect("s1", ConnectOptions::Grpc(options("demo.v1.Echo", "Chat")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(err.to_string().contains("client streaming"));

        assert_eq!(manager.status("s1").status, ConnectionStatus::Disconnected);
        assert!(settle(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_message_must_match_input_type() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(scratch.path());
        let mut opts = options("Echo", "Say");
        opts.message = json!({"no_such_field": 1});

        let err = manager.invoke("r1", opts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(scratch.path());

        let err = manager.invoke("r1", options("Echo", "Say")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);

        let err = manager
            .connect("s1", ConnectOptions::Grpc(options("Echo", "Repeat")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
        let events = settle(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), EventKind::Error);
        assert_eq!(manager.status("s1").status, ConnectionStatus::Error);

        manager.disconnect("s1").await;
        assert_eq!(manager.status("s1").status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_describe() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(scratch.path());
        let services = manager.describe(ECHO_PROTO).await.unwrap();
        assert_eq!(services[0].methods.len(), 4);

        let err = manager.describe("message {").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaError);
    }

    #[test]
    fn test_metadata_to_map() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-trace", "abc".parse().unwrap());
        let map = metadata_to_map(&metadata);
        assert_eq!(map.get("x-trace").map(String::as_str), Some("abc"));
    }

    #[tokio::test]
    async fn test_unary_invoke_returns_message_and_metadata() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, _rx) = manager(scratch.path());
        let url = live_server(scratch.path()).await;

        let mut opts = options("demo.v1.Echo", "Say");
        opts.url = url.clone();
        let response = manager.invoke("r1", opts).await.unwrap();
        assert!(response.ok);
        assert_eq!(response.message, Some(json!({"text": "hi"})));
        assert_eq!(response.status.code, 0);
        assert_eq!(response.status.metadata.get("x-trace-echo").map(String::as_str), Some("abc"));
        assert_eq!(manager.in_flight(), 0);

        let mut opts = options("Echo", "Say");
        opts.url = url;
        opts.message = json!({"text": "fail"});
        let response = manager.invoke("r2", opts).await.unwrap();
        assert!(!response.ok);
        assert_eq!(response.message, None);
        assert_eq!(response.status.code_name, "NotFound");
        assert_eq!(response.status.details, "nothing to say");
        assert!(std::fs::read_dir(scratch.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_server_stream_emits_data_status_end() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(scratch.path());
        let mut opts = options("Echo", "Repeat");
        opts.url = live_server(scratch.path()).await;
        opts.message = json!({"text": "hi", "times": 3});

        manager.connect("s1", ConnectOptions::Grpc(opts)).await.unwrap();

        for i in 0..3 {
            let event = next_event(&mut rx).await;
            assert_eq!(event.payload, EventPayload::Data(json!({"text": format!("hi-{}", i)})));
        }
        match next_event(&mut rx).await.payload {
            EventPayload::Status(status) => assert_eq!(status.code, 0),
            other => panic!("expected status, got {:?}", other),
        }
        assert_eq!(next_event(&mut rx).await.payload, EventPayload::End);
        assert_eq!(next_event(&mut rx).await.kind(), EventKind::Disconnected);
        assert!(settle(&mut rx).await.is_empty());
        assert_eq!(manager.status("s1").status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_cancel_stream_mid_stream() {
        let scratch = tempfile::tempdir().unwrap();
        let (manager, mut rx) = manager(scratch.path());
        let mut opts = options("Echo", "Repeat");
        opts.url = live_server(scratch.path()).await;
        opts.message = json!({"text": "hold", "times": 0});

        manager.connect("s1", ConnectOptions::Grpc(opts)).await.unwrap();
        assert_eq!(next_event(&mut rx).await.payload, EventPayload::Data(json!({"text": "hold-0"})));
        assert_eq!(manager.status("s1").status, ConnectionStatus::Connected);

        manager.disconnect("s1").await;
        let events = settle(&mut rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, EventPayload::Disconnected { reason: None });
        assert_eq!(manager.status("s1").status, ConnectionStatus::Disconnected);

        manager.disconnect("s1").await;
        assert!(settle(&mut rx).await.is_empty());
    }
}
