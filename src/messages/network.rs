//! Network messages - boundary calls into the Network layer and their replies

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{ErrorPayload, ManagerError};
use crate::messages::events::RpcStatus;
use crate::models::{
    ConnectOptions, GrpcCallOptions, Header, HttpRequestOptions, OutboundPayload, Protocol,
};
use crate::network::lifecycle::{ConnectionInfo, ConnectionStatus};

/// Calls accepted at the process boundary, one per verb
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    Connect {
        connection_id: String,
        options: ConnectOptions,
    },
    Send {
        protocol: Protocol,
        connection_id: String,
        payload: OutboundPayload,
    },
    Disconnect {
        protocol: Protocol,
        connection_id: String,
    },
    Status {
        protocol: Protocol,
        connection_id: String,
    },
    /// One-shot HTTP request
    Request {
        request_id: String,
        options: HttpRequestOptions,
    },
    /// Abort an in-flight HTTP request or unary RPC
    Cancel { request_id: String },
    /// Unary RPC
    Invoke {
        request_id: String,
        options: GrpcCallOptions,
    },
    /// Server-streaming RPC under a connection id
    Stream {
        connection_id: String,
        options: GrpcCallOptions,
    },
    CancelStream { connection_id: String },
    /// List the services and methods of a proto schema
    Describe { proto: String },
    /// Close everything and stop the actor
    Shutdown,
}

/// A call paired with the channel its reply goes back on
#[derive(Debug)]
pub struct NetworkCommand {
    pub call: Call,
    pub reply_tx: oneshot::Sender<Reply>,
}

/// HTTP response as returned by `request`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<Header>,
    /// `None` when the response is a stream and was left unread
    pub body: Option<String>,
    pub size: usize,
    pub time_ms: u64,
    pub is_stream: bool,
}

/// Result of a unary RPC: either a message or a non-OK status
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub ok: bool,
    pub message: Option<serde_json::Value>,
    pub status: RpcStatus,
    pub time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub methods: Vec<MethodInfo>,
}

/// Replies, shaped per verb
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Ack {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Status {
        status: ConnectionStatus,
        info: ConnectionInfo,
    },
    Http {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<HttpResponse>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Cancelled {
        cancelled: bool,
    },
    Rpc {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<RpcResponse>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Describe {
        #[serde(skip_serializing_if = "Option::is_none")]
        services: Option<Vec<ServiceInfo>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

impl Reply {
    pub fn ack(result: Result<(), ManagerError>) -> Self {
        match result {
            Ok(()) => Reply::Ack {
                success: true,
                error: None,
            },
            Err(e) => Reply::Ack {
                success: false,
                error: Some(e.into()),
            },
        }
    }

    pub fn status(info: ConnectionInfo) -> Self {
        Reply::Status {
            status: info.status,
            info,
        }
    }

    pub fn http(result: Result<HttpResponse, ManagerError>) -> Self {
        match result {
            Ok(response) => Reply::Http {
                success: true,
                response: Some(response),
                error: None,
            },
            Err(e) => Reply::Http {
                success: false,
                response: None,
                error: Some(e.into()),
            },
        }
    }

    pub fn rpc(result: Result<RpcResponse, ManagerError>) -> Self {
        match result {
            Ok(response) => Reply::Rpc {
                response: Some(response),
                error: None,
            },
            Err(e) => Reply::Rpc {
                response: None,
                error: Some(e.into()),
            },
        }
    }

    pub fn describe(result: Result<Vec<ServiceInfo>, ManagerError>) -> Self {
        match result {
            Ok(services) => Reply::Describe {
                services: Some(services),
                error: None,
            },
            Err(e) => Reply::Describe {
                services: None,
                error: Some(e.into()),
            },
        }
    }

    /// The error carried by this reply, if any
    pub fn error(&self) -> Option<&ErrorPayload> {
        match self {
            Reply::Ack { error, .. }
            | Reply::Http { error, .. }
            | Reply::Rpc { error, .. }
            | Reply::Describe { error, .. } => error.as_ref(),
            Reply::Status { .. } | Reply::Cancelled { .. } => None,
        }
    }
}
