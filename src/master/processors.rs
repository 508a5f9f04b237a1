//! Worker reports arriving at the master
//!
//! Both report kinds are acknowledged once they are queued to the owning
//! workflow runnable. A report for a workflow that is not running here is
//! still acknowledged so the worker stops resending it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::dispatch::host::Host;
use crate::engine::errors::EngineError;
use crate::engine::event::WorkflowEvent;
use crate::engine::repository::WorkflowRunnableRepository;
use crate::remote::command::{Command, CommandBody, CommandType};
use crate::remote::messages::{
    TaskExecuteResult, TaskExecuteResultAck, TaskExecuteRunning, TaskExecuteRunningAck,
    TaskOutcome,
};
use crate::remote::processor::{CommandProcessor, PeerInfo, ProcessorError};

fn parse_host(value: &str) -> Result<Host, ProcessorError> {
    value
        .parse()
        .map_err(|e: String| ProcessorError::failed(format!("bad reporting host: {e}")))
}

/// Queue an event; `false` when the workflow is not running on this master
async fn deliver(
    repository: &WorkflowRunnableRepository,
    workflow_instance_id: i64,
    task_instance_id: i64,
    event: WorkflowEvent,
) -> bool {
    match repository.post(workflow_instance_id, event).await {
        Ok(()) => true,
        Err(EngineError::WorkflowNotFound(_)) | Err(EngineError::QueueClosed(_)) => {
            warn!(
                workflow_instance_id = workflow_instance_id,
                task_instance_id = task_instance_id,
                "Report for a workflow not running here, acknowledging anyway"
            );
            false
        }
        Err(e) => {
            warn!(
                workflow_instance_id = workflow_instance_id,
                task_instance_id = task_instance_id,
                error = %e,
                "Failed to queue report"
            );
            false
        }
    }
}

pub struct TaskExecuteRunningProcessor {
    repository: Arc<WorkflowRunnableRepository>,
}

impl TaskExecuteRunningProcessor {
    pub fn new(repository: Arc<WorkflowRunnableRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl CommandProcessor for TaskExecuteRunningProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskExecuteRunning
    }

    async fn process(
        &self,
        command: Command,
        _peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        let report: TaskExecuteRunning = command.body_as()?;
        let host = parse_host(&report.host)?;
        let event = WorkflowEvent::TaskRunning {
            task_instance_id: report.task_instance_id,
            generation: report.generation,
            host,
            process_id: report.process_id,
            app_ids: report.app_ids,
            start_time: report.start_time,
        };
        let success = deliver(
            &self.repository,
            report.workflow_instance_id,
            report.task_instance_id,
            event,
        )
        .await;

        let ack = TaskExecuteRunningAck {
            task_instance_id: report.task_instance_id,
            success,
        };
        Ok(Some(ack.to_reply(&command)?))
    }

    fn processor_name(&self) -> &str {
        "master_task_running"
    }
}

pub struct TaskExecuteResultProcessor {
    repository: Arc<WorkflowRunnableRepository>,
}

impl TaskExecuteResultProcessor {
    pub fn new(repository: Arc<WorkflowRunnableRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl CommandProcessor for TaskExecuteResultProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskExecuteResult
    }

    async fn process(
        &self,
        command: Command,
        _peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        let report: TaskExecuteResult = command.body_as()?;
        let host = parse_host(&report.host)?;
        let event = match report.outcome {
            TaskOutcome::Success => WorkflowEvent::TaskCompleted {
                task_instance_id: report.task_instance_id,
                generation: report.generation,
                host,
                end_time: report.end_time,
                var_pool: report.var_pool,
            },
            TaskOutcome::Failure | TaskOutcome::Killed => WorkflowEvent::TaskFailed {
                task_instance_id: report.task_instance_id,
                generation: report.generation,
                host,
                end_time: report.end_time,
                killed: report.outcome == TaskOutcome::Killed,
                reason: report.message,
            },
        };
        let success = deliver(
            &self.repository,
            report.workflow_instance_id,
            report.task_instance_id,
            event,
        )
        .await;

        let ack = TaskExecuteResultAck {
            task_instance_id: report.task_instance_id,
            success,
        };
        Ok(Some(ack.to_reply(&command)?))
    }

    fn processor_name(&self) -> &str {
        "master_task_result"
    }
}
