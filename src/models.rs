use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The closed set of protocols the relay speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    WebSocket,
    Sse,
    SocketIo,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::WebSocket => "websocket",
            Protocol::Sse => "sse",
            Protocol::SocketIo => "socketio",
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP Method enum
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
    OPTIONS,
}

impl HttpMethod {
    pub fn as_str(&self) -> &str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
        }
    }

    pub fn has_body(&self) -> bool {
        matches!(self, HttpMethod::POST | HttpMethod::PUT | HttpMethod::PATCH)
    }
}

/// Authentication type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Bearer(String),
    Basic {
        username: String,
        password: String,
    },
}

/// HTTP Header
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

/// Iterate the headers that should actually go on the wire
pub fn enabled_headers(headers: &[Header]) -> impl Iterator<Item = &Header> {
    headers.iter().filter(|h| h.enabled && !h.key.trim().is_empty())
}

/// A one-shot HTTP request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HttpRequestOptions {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub auth: AuthType,
    /// Overrides the configured default timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// When true, ignores SSL certificate errors (useful for testing environments)
    #[serde(default)]
    pub ignore_ssl_errors: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WebSocketOptions {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Offered subprotocols, in preference order
    #[serde(default)]
    pub protocols: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SseOptions {
    pub url: String,
    #[serde(default)]
    pub headers: Vec<Header>,
}

/// Socket.IO transport, listed in preference order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    WebSocket,
    Polling,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SocketIoOptions {
    pub url: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub auth: Option<serde_json::Value>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Empty means "prefer websocket, fall back to polling"
    #[serde(default)]
    pub transports: Vec<Transport>,
}

/// A gRPC call described by raw proto text
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GrpcCallOptions {
    pub url: String,
    /// Schema source, compiled on every call
    pub proto: String,
    /// Full (`pkg.Service`) or short (`Service`) service name
    pub service: String,
    pub method: String,
    /// Request message as JSON
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(default)]
    pub metadata: Vec<Header>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Options for a persistent connection, tagged by protocol
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ConnectOptions {
    WebSocket(WebSocketOptions),
    Sse(SseOptions),
    SocketIo(SocketIoOptions),
    Grpc(GrpcCallOptions),
}

impl ConnectOptions {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectOptions::WebSocket(_) => Protocol::WebSocket,
            ConnectOptions::Sse(_) => Protocol::Sse,
            ConnectOptions::SocketIo(_) => Protocol::SocketIo,
            ConnectOptions::Grpc(_) => Protocol::Grpc,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ConnectOptions::WebSocket(o) => &o.url,
            ConnectOptions::Sse(o) => &o.url,
            ConnectOptions::SocketIo(o) => &o.url,
            ConnectOptions::Grpc(o) => &o.url,
        }
    }
}

/// Payload handed to `send`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundPayload {
    Text {
        data: String,
    },
    Binary {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Named event with an argument list (Socket.IO)
    Event {
        event: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
}

/// Serde helper: `Vec<u8>` as standard base64
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
