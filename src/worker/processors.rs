use async_trait::async_trait;
use std::sync::Arc;

use super::executor::WorkerTaskExecutor;
use crate::remote::command::{Command, CommandBody, CommandType};
use crate::remote::messages::{TaskDispatchRequest, TaskKillRequest};
use crate::remote::processor::{CommandProcessor, PeerInfo, ProcessorError};

pub struct TaskDispatchProcessor {
    executor: Arc<WorkerTaskExecutor>,
}

impl TaskDispatchProcessor {
    pub fn new(executor: Arc<WorkerTaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl CommandProcessor for TaskDispatchProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskDispatchRequest
    }

    async fn process(
        &self,
        command: Command,
        _peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        let request: TaskDispatchRequest = command.body_as()?;
        let response = self.executor.accept(request).await;
        Ok(Some(response.to_reply(&command)?))
    }

    fn processor_name(&self) -> &str {
        "worker_task_dispatch"
    }
}

pub struct TaskKillProcessor {
    executor: Arc<WorkerTaskExecutor>,
}

impl TaskKillProcessor {
    pub fn new(executor: Arc<WorkerTaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl CommandProcessor for TaskKillProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::TaskKillRequest
    }

    async fn process(
        &self,
        command: Command,
        _peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        let request: TaskKillRequest = command.body_as()?;
        let response = self.executor.kill(request.task_instance_id, request.generation).await;
        Ok(Some(response.to_reply(&command)?))
    }

    fn processor_name(&self) -> &str {
        "worker_task_kill"
    }
}
