//! Network layer - protocol managers and the actor that owns them
//!
//! The Network actor receives boundary calls and answers each with a reply;
//! managers push everything that happens afterwards as events, which the
//! forwarder republishes on `<kind>:<connection-id>` topics.

pub mod actor;
pub mod event_stream;
pub mod forwarder;
pub mod grpc;
pub mod http;
pub mod lifecycle;
pub mod registry;
pub mod schema;
pub mod socketio;
pub mod sse;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testutil;

pub use actor::{Managers, NetworkActor};
pub use forwarder::{EventForwarder, Subscription};
pub use lifecycle::{ConnectionInfo, ConnectionManager, ConnectionStatus, EventSink};
