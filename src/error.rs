use crate::config::ConfigurationError;
use crate::dispatch::DispatchError;
use crate::engine::errors::{DaoError, EngineError, StateMachineError};
use crate::registry::RegistryError;
use crate::remote::{ProtocolError, RemotingError};

/// Crate-level error for node bootstrap and cross-module operations
#[derive(Debug, thiserror::Error)]
pub enum DagflowError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Remoting error: {0}")]
    Remoting(#[from] RemotingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Persistence error: {0}")]
    Dao(#[from] DaoError),

    #[error("Failed to bind HTTP views on {address}: {reason}")]
    WebBind { address: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DagflowError>;
