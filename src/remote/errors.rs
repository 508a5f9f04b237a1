use super::command::CommandType;
use std::time::Duration;

/// Frame-level failures. Any of these means the byte stream can no longer be
/// trusted and the connection is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Magic mismatch: expected {expected:#04x}, got {actual:#04x}")]
    MagicMismatch { expected: u8, actual: u8 },

    #[error("Unknown command type ordinal: {0}")]
    UnknownCommandType(u8),

    #[error("Frame body of {length} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Expected {expected} body, got {actual}")]
    UnexpectedCommandType {
        expected: CommandType,
        actual: CommandType,
    },

    #[error("Malformed {command_type} body: {reason}")]
    MalformedBody {
        command_type: CommandType,
        reason: String,
    },
}

/// Failures surfaced to callers of the transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemotingError {
    #[error("Failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Connection to {host} closed")]
    ConnectionClosed { host: String },

    #[error("Request {opaque} to {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        opaque: i64,
        timeout: Duration,
    },

    #[error("Opaque id {0} already has a pending response")]
    DuplicateOpaque(i64),

    #[error("Failed to bind {address}: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl RemotingError {
    /// Timeouts and broken connections are transient; a new attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectFailed { .. } | Self::ConnectionClosed { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for RemotingError {
    fn from(error: std::io::Error) -> Self {
        RemotingError::Io(error.to_string())
    }
}
