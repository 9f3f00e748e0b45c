//! Message types for inter-layer communication in the actor-based architecture.
//!
//! This module defines everything that crosses the process boundary: calls
//! into the Network layer, their replies, and the events pushed back out.

pub mod events;
pub mod network;

pub use events::{
    Direction, EventKind, EventPayload, ManagerEvent, Message, MessageBody, PayloadFormat,
    RpcStatus,
};
pub use network::{Call, HttpResponse, NetworkCommand, Reply, RpcResponse, ServiceInfo};
