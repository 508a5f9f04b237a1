//! Workflow definitions and instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::errors::{EngineError, EngineResult};
use super::state::ExecutionStatus;
use super::task_instance::TaskInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStrategy {
    /// Log a warning and let the task run on
    #[default]
    Warn,
    /// Kill the task and fail it without retry
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub code: i64,
    pub name: String,
    /// Task kind key, e.g. "shell"
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    #[serde(default)]
    pub max_retry_times: u32,
    #[serde(default)]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub timeout_strategy: TimeoutStrategy,
    /// Codes of tasks that must succeed first
    #[serde(default)]
    pub pre_tasks: Vec<i64>,
}

fn default_worker_group() -> String {
    "default".to_string()
}

impl TaskDefinition {
    pub fn new(code: i64, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            kind: kind.into(),
            params: serde_json::Value::Null,
            worker_group: default_worker_group(),
            max_retry_times: 0,
            retry_interval_ms: 0,
            timeout_ms: None,
            timeout_strategy: TimeoutStrategy::Warn,
            pre_tasks: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_pre_tasks(mut self, pre_tasks: impl IntoIterator<Item = i64>) -> Self {
        self.pre_tasks = pre_tasks.into_iter().collect();
        self
    }

    pub fn with_retries(mut self, max_retry_times: u32, retry_interval_ms: u64) -> Self {
        self.max_retry_times = max_retry_times;
        self.retry_interval_ms = retry_interval_ms;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64, strategy: TimeoutStrategy) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self.timeout_strategy = strategy;
        self
    }

    pub fn with_worker_group(mut self, group: impl Into<String>) -> Self {
        self.worker_group = group.into();
        self
    }
}

/// A DAG of task definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: i64,
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    pub fn new(code: i64, name: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        Self {
            code,
            name: name.into(),
            tasks,
        }
    }

    pub fn task(&self, code: i64) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|task| task.code == code)
    }

    /// Reject duplicate codes, dangling predecessors and cycles
    pub fn validate(&self) -> EngineResult<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::InvalidDefinition(format!(
                "workflow '{}' has no tasks",
                self.name
            )));
        }

        let mut codes = HashSet::new();
        for task in &self.tasks {
            if !codes.insert(task.code) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate task code {}",
                    task.code
                )));
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task.pre_tasks.iter().find(|code| !codes.contains(code)) {
                return Err(EngineError::InvalidDefinition(format!(
                    "task {} depends on unknown task {missing}",
                    task.code
                )));
            }
        }

        // Kahn's algorithm: every task must be reachable in topological order
        let mut in_degree: HashMap<i64, usize> = self
            .tasks
            .iter()
            .map(|task| (task.code, task.pre_tasks.len()))
            .collect();
        let mut ready: VecDeque<i64> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(code, _)| *code)
            .collect();
        let mut visited = 0;
        while let Some(code) = ready.pop_front() {
            visited += 1;
            for task in self.tasks.iter().filter(|t| t.pre_tasks.contains(&code)) {
                if let Some(degree) = in_degree.get_mut(&task.code) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(task.code);
                    }
                }
            }
        }
        if visited != self.tasks.len() {
            return Err(EngineError::InvalidDefinition(format!(
                "workflow '{}' contains a cycle",
                self.name
            )));
        }
        Ok(())
    }
}

/// Runtime state of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub definition: WorkflowDefinition,
    pub state: ExecutionStatus,
    /// `host:port` of the owning master
    pub host: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub var_pool: BTreeMap<String, String>,
    /// Task instances by task code; a task has no entry until first submitted
    pub task_instances: BTreeMap<i64, TaskInstance>,
}

impl WorkflowInstance {
    pub fn new(id: i64, definition: WorkflowDefinition, host: impl Into<String>) -> Self {
        Self {
            id,
            definition,
            state: ExecutionStatus::SubmittedSuccess,
            host: host.into(),
            start_time: None,
            end_time: None,
            var_pool: BTreeMap::new(),
            task_instances: BTreeMap::new(),
        }
    }

    pub fn task_by_instance_id(&self, task_instance_id: i64) -> Option<&TaskInstance> {
        self.task_instances
            .values()
            .find(|task| task.id == task_instance_id)
    }

    pub fn task_code_of(&self, task_instance_id: i64) -> Option<i64> {
        self.task_by_instance_id(task_instance_id)
            .map(|task| task.task_code)
    }

    /// Task codes not yet submitted whose predecessors have all succeeded
    pub fn ready_task_codes(&self) -> Vec<i64> {
        self.definition
            .tasks
            .iter()
            .filter(|task| !self.task_instances.contains_key(&task.code))
            .filter(|task| {
                task.pre_tasks.iter().all(|pre| {
                    self.task_instances
                        .get(pre)
                        .is_some_and(|instance| instance.state.is_success())
                })
            })
            .map(|task| task.code)
            .collect()
    }

    pub fn has_active_tasks(&self) -> bool {
        self.task_instances
            .values()
            .any(|task| task.state.is_active())
    }

    pub fn all_tasks_succeeded(&self) -> bool {
        self.definition.tasks.iter().all(|task| {
            self.task_instances
                .get(&task.code)
                .is_some_and(|instance| instance.state.is_success())
        })
    }

    pub fn has_failed_tasks(&self) -> bool {
        self.task_instances
            .values()
            .any(|task| matches!(task.state, ExecutionStatus::Failure | ExecutionStatus::Kill))
    }
}
