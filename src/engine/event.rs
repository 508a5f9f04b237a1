//! Inputs to the execution state machines

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::dispatch::host::Host;

/// Operator commands against a workflow instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Stop,
    Kill,
    /// Leave PAUSE/STOP and re-run everything not yet successful
    Resume,
    /// Mark a failed or killed task as done while the workflow is held
    ForceTaskSuccess { task_instance_id: i64 },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::Resume => "resume",
            Self::ForceTaskSuccess { .. } => "force_task_success",
        }
    }
}

/// Event queued to a workflow runnable.
///
/// Task-scoped events carry the dispatch generation they belong to; an event
/// whose generation is not the task's current one is stale and dropped.
/// Worker reports also carry the reporting host, which must be the host the
/// attempt was dispatched to.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// Begin (or, for a recovered instance, resume) execution
    Start,
    TaskDispatched {
        task_instance_id: i64,
        generation: u32,
        host: Host,
    },
    /// Worker acknowledged that the task is running
    TaskRunning {
        task_instance_id: i64,
        generation: u32,
        host: Host,
        process_id: Option<u32>,
        app_ids: Vec<String>,
        start_time: DateTime<Utc>,
    },
    TaskCompleted {
        task_instance_id: i64,
        generation: u32,
        host: Host,
        end_time: DateTime<Utc>,
        var_pool: BTreeMap<String, String>,
    },
    TaskFailed {
        task_instance_id: i64,
        generation: u32,
        host: Host,
        end_time: DateTime<Utc>,
        /// Ended by a kill request rather than by failing
        killed: bool,
        reason: Option<String>,
    },
    DispatchFailed {
        task_instance_id: i64,
        generation: u32,
        reason: String,
    },
    NodeDown {
        host: Host,
    },
    Control(ControlCommand),
    RetryTimerFired {
        task_instance_id: i64,
        generation: u32,
    },
    TaskTimeout {
        task_instance_id: i64,
        generation: u32,
    },
}

impl WorkflowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::TaskDispatched { .. } => "task_dispatched",
            Self::TaskRunning { .. } => "task_running",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::DispatchFailed { .. } => "dispatch_failed",
            Self::NodeDown { .. } => "node_down",
            Self::Control(_) => "control",
            Self::RetryTimerFired { .. } => "retry_timer_fired",
            Self::TaskTimeout { .. } => "task_timeout",
        }
    }

    /// Reporting worker, for events that come from a worker
    pub fn report_host(&self) -> Option<&Host> {
        match self {
            Self::TaskRunning { host, .. }
            | Self::TaskCompleted { host, .. }
            | Self::TaskFailed { host, .. } => Some(host),
            _ => None,
        }
    }

    /// `(task_instance_id, generation)` for task-scoped events
    pub fn task_scope(&self) -> Option<(i64, u32)> {
        match self {
            Self::TaskDispatched {
                task_instance_id,
                generation,
                ..
            }
            | Self::TaskRunning {
                task_instance_id,
                generation,
                ..
            }
            | Self::TaskCompleted {
                task_instance_id,
                generation,
                ..
            }
            | Self::TaskFailed {
                task_instance_id,
                generation,
                ..
            }
            | Self::DispatchFailed {
                task_instance_id,
                generation,
                ..
            }
            | Self::RetryTimerFired {
                task_instance_id,
                generation,
            }
            | Self::TaskTimeout {
                task_instance_id,
                generation,
            } => Some((*task_instance_id, *generation)),
            Self::Start | Self::NodeDown { .. } | Self::Control(_) => None,
        }
    }
}

/// Normalized input to the task transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Worker accepted the dispatch
    Dispatch,
    /// Worker reported the task running
    Ack,
    Succeed,
    Fail { retry: bool },
    Killed,
    /// Dispatch attempts exhausted
    DispatchFail,
    /// Host died; re-dispatch if the failover budget allows
    Failover { budget_left: bool },
    RetryTimer,
    Timeout,
    Pause,
    Kill,
    /// Explicit recovery from a holding or failed state
    Recover,
    ForceSuccess,
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Ack => "ack",
            Self::Succeed => "succeed",
            Self::Fail { .. } => "fail",
            Self::Killed => "killed",
            Self::DispatchFail => "dispatch_fail",
            Self::Failover { .. } => "failover",
            Self::RetryTimer => "retry_timer",
            Self::Timeout => "timeout",
            Self::Pause => "pause",
            Self::Kill => "kill",
            Self::Recover => "recover",
            Self::ForceSuccess => "force_success",
        }
    }
}
