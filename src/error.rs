use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

/// Classification of a failed connection attempt, as reported with [`StoreEvent::ConnectionLost`](crate::types::StoreEvent::ConnectionLost).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionFailure {
    /// The host could not be reached or answered with an error.
    Unreachable,
    /// The request was refused by the client runtime, typically a cross-origin policy violation.
    CrossOrigin,
}

impl ConnectionFailure {
    pub fn code(&self) -> u16 {
        match self {
            Self::Unreachable => 404,
            Self::CrossOrigin => 403,
        }
    }
}

impl Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable"),
            Self::CrossOrigin => write!(f, "cross-origin"),
        }
    }
}

/// Error reported by a [`Fetcher`](crate::network::Fetcher) or a [`PushSource`](crate::network::PushSource).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct FetchError {
    pub status:  Option<u16>,
    pub message: String,
}

impl FetchError {
    pub fn new<S: ToString>(message: S) -> Self {
        Self {
            status:  None,
            message: message.to_string(),
        }
    }

    pub fn with_status<S: ToString>(status: u16, message: S) -> Self {
        Self {
            status:  Some(status),
            message: message.to_string(),
        }
    }

    /// A `TypeError` that isn't the runtime's generic "failed to fetch" is what a blocked cross-origin request looks
    /// like. Everything else is treated as the host being unreachable.
    pub fn failure(&self) -> ConnectionFailure {
        let generic = ["Failed to fetch", "NetworkError", "Load failed"];
        if self.message.contains("TypeError") && !generic.iter().any(|g| self.message.contains(g)) {
            ConnectionFailure::CrossOrigin
        }
        else {
            ConnectionFailure::Unreachable
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwrError {
    #[error("Unknown table '{0}'")]
    UnknownTable(String),

    #[error("Duplicate key '{0}' in the incoming dataset")]
    DuplicateKey(String),

    #[error("Record '{id}' not found in '{table}'")]
    NotFound { table: String, id: String },

    #[error("Record for '{table}' has no usable key")]
    MissingKey { table: String },

    #[error("Unexpected payload for '{table}': {message}")]
    Payload { table: String, message: String },

    #[error("Request '{kind}' timed out")]
    Timeout { kind: String },

    #[error("Request '{kind}' failed: {message}")]
    Remote { kind: String, message: String },

    #[error("Transport channel is closed")]
    TransportClosed,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Store has been disposed")]
    Disposed,

    #[error("Result belongs to a previous connection")]
    Stale,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("A dump is already in progress")]
    DumpInProgress,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for SwrError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<std::io::Error> for SwrError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T, E = SwrError> = std::result::Result<T, E>;
