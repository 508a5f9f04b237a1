use serde::{Deserialize, Serialize};
use std::fmt;

use super::host::Host;
use crate::remote::messages::TaskExecutionContext;

/// Which kind of executor runs a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorType {
    Worker,
    Client,
    Master,
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorType::Worker => write!(f, "WORKER"),
            ExecutorType::Client => write!(f, "CLIENT"),
            ExecutorType::Master => write!(f, "MASTER"),
        }
    }
}

/// One dispatch attempt. `host` is filled in once a host has been selected;
/// set beforehand, it pins the attempt to that host.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub executor_type: ExecutorType,
    pub task: TaskExecutionContext,
    pub host: Option<Host>,
    /// Never selected for this attempt
    pub excluded_hosts: Vec<Host>,
}

impl ExecutionContext {
    pub fn new(executor_type: ExecutorType, task: TaskExecutionContext) -> Self {
        Self {
            executor_type,
            task,
            host: None,
            excluded_hosts: Vec::new(),
        }
    }

    pub fn task_instance_id(&self) -> i64 {
        self.task.task_instance_id
    }

    pub fn workflow_instance_id(&self) -> i64 {
        self.task.workflow_instance_id
    }

    pub fn worker_group(&self) -> &str {
        &self.task.worker_group
    }
}
