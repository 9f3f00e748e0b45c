//! Error taxonomy shared by every protocol manager

use serde::{Deserialize, Serialize};

use crate::models::Protocol;

/// Serializable error category sent across the boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    ConnectionNotFound,
    AlreadyConnected,
    UnsupportedOperation,
    TransportError,
    SchemaError,
    InvalidOptions,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    #[error("already connected: {0}")]
    AlreadyConnected(String),
    #[error("{operation} is not supported by {protocol}")]
    Unsupported {
        protocol: Protocol,
        operation: &'static str,
    },
    #[error("{0}")]
    Transport(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("request cancelled")]
    Cancelled,
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionNotFound(_) => ErrorKind::ConnectionNotFound,
            Self::AlreadyConnected(_) => ErrorKind::AlreadyConnected,
            Self::Unsupported { .. } => ErrorKind::UnsupportedOperation,
            Self::Transport(_) => ErrorKind::TransportError,
            Self::Schema(_) => ErrorKind::SchemaError,
            Self::InvalidOptions(_) => ErrorKind::InvalidOptions,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn unsupported(protocol: Protocol, operation: &'static str) -> Self {
        Self::Unsupported {
            protocol,
            operation,
        }
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ManagerError {
    fn from(e: reqwest::Error) -> Self {
        let msg = if e.is_timeout() {
            format!("Request timed out: {}", e)
        } else if e.is_connect() {
            format!("Connection failed: {}", e)
        } else if e.is_builder() {
            return ManagerError::InvalidOptions(e.to_string());
        } else {
            format!("Request failed: {}", e)
        };
        ManagerError::Transport(msg)
    }
}

/// Error as it crosses the boundary: a category plus the passed-through message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorPayload {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ManagerError> for ErrorPayload {
    fn from(e: &ManagerError) -> Self {
        ErrorPayload {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<ManagerError> for ErrorPayload {
    fn from(e: ManagerError) -> Self {
        ErrorPayload::from(&e)
    }
}
