//! Events - pushed from the Network layer to subscribers on `<kind>:<connection-id>` topics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorPayload;
use crate::models::base64_bytes;
use crate::network::sse::SseFrame;

/// Direction of a message relative to the relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
    /// Synthetic lifecycle markers produced by the relay itself
    System,
}

/// Best-effort format of a text payload, for display only
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Json,
    Xml,
    Html,
    Text,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text {
        data: String,
        format: PayloadFormat,
        size: usize,
    },
    Binary {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        size: usize,
    },
    /// One event-stream frame
    Event(SseFrame),
    SocketIo {
        event: String,
        args: Vec<serde_json::Value>,
    },
    Connected,
    Disconnected {
        reason: Option<String>,
    },
    Error {
        message: String,
    },
}

/// One immutable unit of protocol traffic
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub direction: Direction,
    /// Monotonic per connection
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Final status of an RPC
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: i32,
    pub code_name: String,
    pub details: String,
    pub metadata: BTreeMap<String, String>,
}

impl RpcStatus {
    pub fn ok(metadata: BTreeMap<String, String>) -> Self {
        RpcStatus {
            code: 0,
            code_name: String::from("OK"),
            details: String::new(),
            metadata,
        }
    }

    pub fn from_status(status: &tonic::Status) -> Self {
        RpcStatus {
            code: status.code() as i32,
            code_name: format!("{:?}", status.code()),
            details: status.message().to_string(),
            metadata: crate::network::grpc::metadata_to_map(status.metadata()),
        }
    }
}

/// Event kinds, one topic family each
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Close,
    Disconnected,
    Error,
    Data,
    End,
    Status,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::Close => "close",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::Data => "data",
            EventKind::End => "end",
            EventKind::Status => "status",
        }
    }

    /// Topic name for this kind on a connection; computable without discovery
    pub fn channel(&self, connection_id: &str) -> String {
        format!("{}:{}", self.as_str(), connection_id)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum EventPayload {
    Message(Message),
    Close { code: u16, reason: String },
    Disconnected { reason: Option<String> },
    Error(ErrorPayload),
    /// One RPC response message as JSON
    Data(serde_json::Value),
    End,
    Status(RpcStatus),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Message(_) => EventKind::Message,
            EventPayload::Close { .. } => EventKind::Close,
            EventPayload::Disconnected { .. } => EventKind::Disconnected,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::Data(_) => EventKind::Data,
            EventPayload::End => EventKind::End,
            EventPayload::Status(_) => EventKind::Status,
        }
    }
}

/// An event emitted by a manager for one connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagerEvent {
    pub connection_id: String,
    pub payload: EventPayload,
}

impl ManagerEvent {
    pub fn new(connection_id: impl Into<String>, payload: EventPayload) -> Self {
        ManagerEvent {
            connection_id: connection_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn channel(&self) -> String {
        self.kind().channel(&self.connection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_naming() {
        assert_eq!(EventKind::Message.channel("abc"), "message:abc");
        let event = ManagerEvent::new("ws-1", EventPayload::End);
        assert_eq!(event.channel(), "end:ws-1");
    }

    #[test]
    fn test_message_serializes_flat() {
        let message = Message {
            direction: Direction::Received,
            seq: 3,
            timestamp: Utc::now(),
            body: MessageBody::Text {
                data: String::from("hi"),
                format: PayloadFormat::Text,
                size: 2,
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["direction"], "received");
        assert_eq!(value["size"], 2);
    }

    #[test]
    fn test_event_frame_message_subtype() {
        let body = MessageBody::Event(SseFrame {
            id: Some(String::from("7")),
            event: String::from("tick"),
            data: String::from("a\nb"),
            retry: None,
        });
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "tick");
        assert_eq!(value["data"], "a\nb");
    }
}
