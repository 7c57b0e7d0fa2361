//! Error types for epc-station

use thiserror::Error;

/// Failures reported by a [`RemoteSink`](crate::remote::RemoteSink).
///
/// Only `Connectivity` flips the station into offline mode; the rest are
/// left to the caller's retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("record store unreachable: {0}")]
    Connectivity(String),

    #[error("record store temporarily unavailable: {0}")]
    Transient(String),

    #[error("record store rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected response from record store: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Whether this failure means the record store cannot be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Connectivity(_))
    }
}

#[derive(Error, Debug)]
pub enum StationError {
    #[error("invalid EPC code {code:?}: {reason}")]
    InvalidTag { code: String, reason: &'static str },

    #[error("local queue error: {0}")]
    LocalPersistence(#[from] rusqlite::Error),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("config encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, StationError>;
