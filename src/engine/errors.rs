use thiserror::Error;

use super::state::ExecutionStatus;

#[derive(Debug, Clone, Error)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from} on {event}")]
    InvalidTransition {
        from: ExecutionStatus,
        event: String,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;

#[derive(Debug, Clone, Error)]
pub enum DaoError {
    #[error("Workflow instance {0} not found")]
    WorkflowInstanceNotFound(i64),

    #[error("Persistence operation failed: {reason}")]
    PersistenceFailed { reason: String },
}

pub type DaoResult<T> = Result<T, DaoError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Workflow instance {0} is not running on this master")]
    WorkflowNotFound(i64),

    #[error("Workflow instance {0} is already running")]
    AlreadyRunning(i64),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Event queue of workflow instance {0} is closed")]
    QueueClosed(i64),

    #[error(transparent)]
    Dao(#[from] DaoError),
}

pub type EngineResult<T> = Result<T, EngineError>;
