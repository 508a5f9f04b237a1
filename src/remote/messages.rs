//! Typed command bodies exchanged between masters and workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::command::{CommandBody, CommandType};

/// Everything a worker needs to run one task instance attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionContext {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub task_name: String,
    /// Task kind key resolved by the worker's plugin registry (e.g. "shell")
    pub task_kind: String,
    pub params: serde_json::Value,
    pub var_pool: BTreeMap<String, String>,
    pub worker_group: String,
    /// Dispatch generation; reports for an older generation are ignored by the master
    pub generation: u32,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatchRequest {
    /// `host:port` of the master's RPC server, where progress is reported
    pub master_address: String,
    pub context: TaskExecutionContext,
}

impl CommandBody for TaskDispatchRequest {
    const COMMAND_TYPE: CommandType = CommandType::TaskDispatchRequest;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatchResponse {
    pub task_instance_id: i64,
    pub accepted: bool,
    pub reason: Option<String>,
}

impl TaskDispatchResponse {
    pub fn accepted(task_instance_id: i64) -> Self {
        Self {
            task_instance_id,
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(task_instance_id: i64, reason: impl Into<String>) -> Self {
        Self {
            task_instance_id,
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

impl CommandBody for TaskDispatchResponse {
    const COMMAND_TYPE: CommandType = CommandType::TaskDispatchResponse;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteRunning {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub generation: u32,
    /// `host:port` of the worker running the task
    pub host: String,
    pub process_id: Option<u32>,
    pub app_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
}

impl CommandBody for TaskExecuteRunning {
    const COMMAND_TYPE: CommandType = CommandType::TaskExecuteRunning;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteRunningAck {
    pub task_instance_id: i64,
    pub success: bool,
}

impl CommandBody for TaskExecuteRunningAck {
    const COMMAND_TYPE: CommandType = CommandType::TaskExecuteRunningAck;
}

/// Final outcome reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteResult {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub generation: u32,
    pub host: String,
    pub outcome: TaskOutcome,
    pub end_time: DateTime<Utc>,
    pub process_id: Option<u32>,
    pub app_ids: Vec<String>,
    /// Output variables merged into the workflow's variable pool on success
    pub var_pool: BTreeMap<String, String>,
    pub message: Option<String>,
}

impl CommandBody for TaskExecuteResult {
    const COMMAND_TYPE: CommandType = CommandType::TaskExecuteResult;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecuteResultAck {
    pub task_instance_id: i64,
    pub success: bool,
}

impl CommandBody for TaskExecuteResultAck {
    const COMMAND_TYPE: CommandType = CommandType::TaskExecuteResultAck;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskKillRequest {
    pub task_instance_id: i64,
    /// Only this attempt, which the worker also refuses if it arrives later;
    /// `None` stops whatever attempt is running
    #[serde(default)]
    pub generation: Option<u32>,
}

impl CommandBody for TaskKillRequest {
    const COMMAND_TYPE: CommandType = CommandType::TaskKillRequest;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskKillResponse {
    pub task_instance_id: i64,
    /// False when the worker had no such task running
    pub killed: bool,
    pub process_id: Option<u32>,
    pub app_ids: Vec<String>,
}

impl CommandBody for TaskKillResponse {
    const COMMAND_TYPE: CommandType = CommandType::TaskKillResponse;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::command::Command;

    #[test]
    fn test_typed_body_survives_command_wrapping() {
        let request = TaskKillRequest {
            task_instance_id: 42,
            generation: None,
        };
        let command = request.to_command().unwrap();
        assert_eq!(command.command_type(), CommandType::TaskKillRequest);

        let response = TaskKillResponse {
            task_instance_id: 42,
            killed: true,
            process_id: Some(1234),
            app_ids: vec![],
        };
        let reply: Command = response.to_reply(&command).unwrap();
        assert_eq!(reply.opaque(), command.opaque());
        assert_eq!(reply.body_as::<TaskKillResponse>().unwrap(), response);
    }

    #[test]
    fn test_kill_request_without_generation_targets_any_attempt() {
        let request: TaskKillRequest =
            serde_json::from_str(r#"{"task_instance_id": 9}"#).unwrap();
        assert_eq!(request.generation, None);
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&TaskOutcome::Killed).unwrap();
        assert_eq!(json, "\"killed\"");
    }
}
