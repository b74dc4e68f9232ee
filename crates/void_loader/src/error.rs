//! Loader errors
//!
//! Local-phase failures are recoverable (the request falls through to the
//! network), transport failures are terminal for a request, persistence
//! failures are only logged.

use std::path::PathBuf;
use thiserror::Error;

use crate::payload::PayloadKind;

/// Errors produced by a transport fetch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Request cancelled")]
    Cancelled,
}

/// Errors produced while decoding raw bytes into a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to decode {kind:?} payload: {message}")]
pub struct DecodeError {
    pub kind: PayloadKind,
    pub message: String,
}

impl DecodeError {
    pub fn new(kind: PayloadKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Loader errors
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Locator must not be empty")]
    EmptyLocator,

    #[error("Failed to read cached file {path:?}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to persist {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to downgrade {id} from version {stored} to {requested}")]
    VersionDowngradeRejected {
        id: String,
        stored: u32,
        requested: u32,
    },

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown request: {0}")]
    UnknownRequest(u64),

    #[error("Unknown group: {0}")]
    UnknownGroup(u64),
}

impl LoaderError {
    /// Whether this error came from the transport layer
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type for loader operations
pub type LoaderResult<T> = Result<T, LoaderError>;
