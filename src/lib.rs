//! # Freeman Relay
//!
//! The connection layer behind Freeman: HTTP, WebSocket, event streams (SSE),
//! Socket.IO and gRPC behind one connection lifecycle.
//!
//! ## Features
//! - One-shot HTTP requests with cancellation and stream detection
//! - WebSocket with custom headers and subprotocols
//! - Incremental event-stream frame parsing
//! - Socket.IO named events
//! - Unary and server-streaming gRPC from proto text, no codegen
//! - Per-connection event topics (`<kind>:<connection-id>`)
//!
//! ## Architecture
//! Actor-based with channels:
//! - App Layer (adapters) - issues calls, subscribes to topics
//! - Network Layer (Tokio runtime) - one manager per protocol
//! - Event Forwarder - fans manager events out to topics

pub mod app;
pub mod config;
pub mod constants;
pub mod error;
pub mod messages;
pub mod models;
pub mod network;

// Re-export commonly used types
pub use app::{Boundary, ConnectionLog};
pub use config::Config;
pub use error::{ErrorKind, ErrorPayload, ManagerError};
pub use messages::{Call, EventKind, EventPayload, ManagerEvent, NetworkCommand, Reply};
pub use models::{ConnectOptions, HttpMethod, HttpRequestOptions, OutboundPayload, Protocol};
pub use network::{ConnectionManager, ConnectionStatus, EventForwarder, NetworkActor};
