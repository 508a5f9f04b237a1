use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("Lease {0} not found or expired")]
    LeaseNotFound(i64),

    #[error("Invalid heartbeat at {key}: {reason}")]
    InvalidHeartBeat { key: String, reason: String },

    #[error("Registry backend error: {0}")]
    Backend(String),

    #[error("Registry client is not started")]
    NotStarted,
}

pub type RegistryResult<T> = Result<T, RegistryError>;
