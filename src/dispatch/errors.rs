use thiserror::Error;

use super::context::ExecutorType;
use crate::remote::errors::{ProtocolError, RemotingError};

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Nothing can ever dispatch this executor type; retrying will not help
    #[error("No executor manager registered for executor type {executor_type}")]
    ExecutorManagerNotFound { executor_type: ExecutorType },

    #[error("No available {executor_type} host in worker group '{worker_group}'")]
    NoAvailableHost {
        executor_type: ExecutorType,
        worker_group: String,
    },

    #[error("Selected host '{host}' has no usable address")]
    UnusableHost { host: String },

    #[error("Host {host} rejected task instance {task_instance_id}: {reason}")]
    Rejected {
        host: String,
        task_instance_id: i64,
        reason: String,
    },

    #[error("Failed to send dispatch request to {host}: {source}")]
    Remoting {
        host: String,
        #[source]
        source: RemotingError,
    },

    #[error("Invalid dispatch reply: {0}")]
    Protocol(#[from] ProtocolError),
}

impl DispatchError {
    /// Configuration errors are permanent; everything else may succeed on a
    /// fresh selection.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::ExecutorManagerNotFound { .. })
    }

    /// The request may have reached the worker even though no answer came
    /// back, so the worker may be running the task
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            DispatchError::Remoting { source, .. }
                if source.is_timeout() || matches!(source, RemotingError::ConnectionClosed { .. })
        )
    }

    /// No host could take the task (as opposed to a send failure)
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            DispatchError::NoAvailableHost { .. } | DispatchError::UnusableHost { .. }
        )
    }
}
