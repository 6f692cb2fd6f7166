use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SeqId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request was malformed or exceeds the context; no slot was consumed.
    InvalidRequest,
    /// The model runtime failed on a batch the task was part of.
    RuntimeFailure,
    /// The request referenced an unknown task or slot.
    NotFound,
    /// Reserved for explicit admission rejection.
    ServerBusy,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::RuntimeFailure => "runtime_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ServerBusy => "server_busy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ServerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeFailure, message)
    }

    pub fn shutdown() -> Self {
        Self::runtime("server shutting down")
    }
}

impl From<RuntimeError> for ServerError {
    fn from(value: RuntimeError) -> Self {
        Self::runtime(value.to_string())
    }
}

/// Errors reported by a [`ModelRuntime`](crate::runtime::ModelRuntime).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("sequence {seq} has no position {pos}")]
    Position { seq: SeqId, pos: usize },
    #[error("invalid snapshot: {0}")]
    Snapshot(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
