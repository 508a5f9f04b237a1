use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("Unknown task kind: {0}")]
    UnknownKind(String),

    #[error("Invalid parameters for {kind} task: {reason}")]
    InvalidParams { kind: String, reason: String },

    #[error("Failed to start task: {0}")]
    SpawnFailed(String),

    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),
}

pub type TaskResult<T> = Result<T, TaskError>;
