use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::ExecutionStatus;
use super::workflow::TaskDefinition;
use crate::dispatch::host::Host;
use crate::remote::messages::TaskExecutionContext;

/// One task of a workflow instance.
///
/// Only the owning workflow runnable mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub name: String,
    pub kind: String,
    pub state: ExecutionStatus,
    pub host: Option<Host>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_times: u32,
    pub failover_times: u32,
    /// Bumped on every dispatch attempt
    pub generation: u32,
    pub process_id: Option<u32>,
    pub app_ids: Vec<String>,
    pub var_pool: BTreeMap<String, String>,
    pub message: Option<String>,
}

impl TaskInstance {
    pub fn new(id: i64, definition: &TaskDefinition, workflow_instance_id: i64) -> Self {
        Self {
            id,
            workflow_instance_id,
            task_code: definition.code,
            name: definition.name.clone(),
            kind: definition.kind.clone(),
            state: ExecutionStatus::SubmittedSuccess,
            host: None,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            retry_times: 0,
            failover_times: 0,
            generation: 0,
            process_id: None,
            app_ids: Vec::new(),
            var_pool: BTreeMap::new(),
            message: None,
        }
    }

    /// Reset per-attempt fields for a new dispatch attempt
    pub fn begin_attempt(&mut self) {
        self.generation += 1;
        self.host = None;
        self.submit_time = Utc::now();
        self.start_time = None;
        self.end_time = None;
        self.process_id = None;
        self.app_ids.clear();
    }

    pub fn is_on_host(&self, host: &Host) -> bool {
        self.host.as_ref() == Some(host)
    }

    pub fn execution_context(
        &self,
        definition: &TaskDefinition,
        var_pool: &BTreeMap<String, String>,
    ) -> TaskExecutionContext {
        TaskExecutionContext {
            task_instance_id: self.id,
            workflow_instance_id: self.workflow_instance_id,
            task_name: self.name.clone(),
            task_kind: self.kind.clone(),
            params: definition.params.clone(),
            var_pool: var_pool.clone(),
            worker_group: definition.worker_group.clone(),
            generation: self.generation,
            timeout_ms: definition.timeout_ms,
        }
    }
}
