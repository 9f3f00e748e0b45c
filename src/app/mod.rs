//! App layer - the presentation side of the network boundary
//!
//! Adapters issue boundary calls and hand out topic subscriptions; the
//! connection log keeps whatever history the caller wants to keep.

pub mod adapter;
pub mod history;

pub use adapter::{AdapterResult, Boundary, ConnectionAdapter, HttpAdapter, RpcAdapter};
pub use history::ConnectionLog;
