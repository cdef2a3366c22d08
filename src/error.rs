//! WolfCoord Error Types

use thiserror::Error;

use crate::coordination::SessionId;

/// Result type alias for WolfCoord operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfCoord error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination service errors
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Session {0} expired")]
    SessionExpired(SessionId),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version mismatch on {path}: expected {expected}, found {actual}")]
    BadVersion { path: String, expected: i32, actual: i32 },

    #[error("Ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // Protocol errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is an expected race: the node was already gone
    pub fn is_race(&self) -> bool {
        matches!(self, Error::NoNode(_))
    }

    /// Check if this error means the session can no longer be used
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_) | Error::SessionExpired(_)
        )
    }

    /// Check if this error indicates a logic error that cannot be recovered
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_))
    }
}
