//! Application constants
//!
//! Centralized location for magic strings and configuration defaults.

/// Application name
pub const APP_NAME: &str = "Freeman Relay";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory under the user's home holding Freeman files
pub const CONFIG_DIR_NAME: &str = ".freeman";

/// Relay configuration file name inside [`CONFIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "relay.yaml";

/// Default timeout for one-shot HTTP requests
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for unary RPC calls
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for opening a persistent connection
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// How long `disconnect` waits for a read loop to wind down
pub const DEFAULT_DISCONNECT_GRACE_MS: u64 = 5_000;

/// Per-topic broadcast capacity
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Content types that mark an HTTP response as a stream
pub const STREAMING_CONTENT_TYPES: &[&str] = &[
    "text/event-stream",
    "application/x-ndjson",
    "application/stream+json",
];

/// Event name used for event-stream frames without an `event:` field
pub const DEFAULT_SSE_EVENT: &str = "message";

/// Default Socket.IO namespace
pub const DEFAULT_SOCKETIO_NAMESPACE: &str = "/";

/// Disconnect reason reported for client-initiated Socket.IO disconnects
pub const SOCKETIO_CLIENT_DISCONNECT: &str = "io client disconnect";

/// File name used for the RPC schema inside its scratch directory
pub const SCHEMA_FILE_NAME: &str = "schema.proto";

/// Prefix for RPC schema scratch directories
pub const SCHEMA_SCRATCH_PREFIX: &str = "freeman-proto-";

/// Messages kept per connection log in the app layer
pub const DEFAULT_LOG_CAPACITY: usize = 500;
