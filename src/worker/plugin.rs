//! # Task Plugins
//!
//! A task kind is implemented by a [`TaskPlugin`] that builds a
//! [`RunnableTask`] for each dispatched context. The worker drives every task
//! through the same lifecycle: `init`, `submit`, `track_status`, with
//! `cancel` callable at any point from a kill request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::errors::{TaskError, TaskResult};
use crate::remote::messages::{TaskExecutionContext, TaskOutcome};

/// Final status of a task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExecution {
    pub outcome: TaskOutcome,
    pub var_pool: BTreeMap<String, String>,
    pub message: Option<String>,
}

impl TaskExecution {
    pub fn success(var_pool: BTreeMap<String, String>) -> Self {
        Self {
            outcome: TaskOutcome::Success,
            var_pool,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outcome: TaskOutcome::Failure,
            var_pool: BTreeMap::new(),
            message: Some(message.into()),
        }
    }

    pub fn killed() -> Self {
        Self {
            outcome: TaskOutcome::Killed,
            var_pool: BTreeMap::new(),
            message: Some("task was killed".to_string()),
        }
    }
}

#[async_trait]
pub trait RunnableTask: Send + Sync {
    /// Validate parameters and prepare local resources
    async fn init(&self) -> TaskResult<()>;

    /// Start the external job
    async fn submit(&self) -> TaskResult<()>;

    /// Wait for the job to finish
    async fn track_status(&self) -> TaskResult<TaskExecution>;

    /// Stop the job; a pending `track_status` then reports `Killed`
    async fn cancel(&self) -> TaskResult<()>;

    fn process_id(&self) -> Option<u32> {
        None
    }

    fn app_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Shell,
    Noop,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Shell => write!(f, "shell"),
            TaskKind::Noop => write!(f, "noop"),
        }
    }
}

impl FromStr for TaskKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Ok(TaskKind::Shell),
            "noop" => Ok(TaskKind::Noop),
            _ => Err(TaskError::UnknownKind(s.to_string())),
        }
    }
}

/// Builds runnable tasks of one kind
pub trait TaskPlugin: Send + Sync {
    fn kind(&self) -> TaskKind;

    fn create(&self, context: &TaskExecutionContext) -> TaskResult<Arc<dyn RunnableTask>>;
}

/// Task kind → plugin table
#[derive(Default)]
pub struct TaskPluginRegistry {
    plugins: HashMap<TaskKind, Arc<dyn TaskPlugin>>,
}

impl TaskPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in shell and noop plugins
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellTaskPlugin));
        registry.register(Arc::new(NoopTaskPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn TaskPlugin>) {
        debug!(kind = %plugin.kind(), "Registered task plugin");
        self.plugins.insert(plugin.kind(), plugin);
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.plugins.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.to_string());
        kinds
    }

    pub fn create(&self, context: &TaskExecutionContext) -> TaskResult<Arc<dyn RunnableTask>> {
        let kind: TaskKind = context.task_kind.parse()?;
        let plugin = self
            .plugins
            .get(&kind)
            .ok_or_else(|| TaskError::UnknownKind(context.task_kind.clone()))?;
        plugin.create(context)
    }
}

/// Cancellation latch shared by the built-in tasks
#[derive(Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
}

pub struct ShellTaskPlugin;

impl TaskPlugin for ShellTaskPlugin {
    fn kind(&self) -> TaskKind {
        TaskKind::Shell
    }

    fn create(&self, context: &TaskExecutionContext) -> TaskResult<Arc<dyn RunnableTask>> {
        let params: ShellParams =
            serde_json::from_value(context.params.clone()).map_err(|e| TaskError::InvalidParams {
                kind: TaskKind::Shell.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(ShellTask::new(
            context.task_instance_id,
            params.command,
            context.var_pool.clone(),
        )))
    }
}

/// Runs a command line through `sh -c`.
///
/// Workflow variables are exported as environment variables. Output lines of
/// the form `${setValue(key=value)}` add `key` to the task's output variables.
pub struct ShellTask {
    task_instance_id: i64,
    command: String,
    env: BTreeMap<String, String>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    signal: CancelSignal,
}

impl ShellTask {
    pub fn new(task_instance_id: i64, command: String, env: BTreeMap<String, String>) -> Self {
        Self {
            task_instance_id,
            command,
            env,
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            signal: CancelSignal::default(),
        }
    }
}

#[async_trait]
impl RunnableTask for ShellTask {
    async fn init(&self) -> TaskResult<()> {
        if self.command.trim().is_empty() {
            return Err(TaskError::InvalidParams {
                kind: TaskKind::Shell.to_string(),
                reason: "command is empty".to_string(),
            });
        }
        Ok(())
    }

    async fn submit(&self) -> TaskResult<()> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskError::SpawnFailed(e.to_string()))?;

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::SeqCst);
        }
        info!(
            task_instance_id = self.task_instance_id,
            pid = child.id(),
            "Shell task started"
        );
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn track_status(&self) -> TaskResult<TaskExecution> {
        let mut child = self
            .child
            .lock()
            .await
            .take()
            .ok_or_else(|| TaskError::ExecutionFailed("task was not submitted".to_string()))?;

        let stdout = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut outputs = BTreeMap::new();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some((key, value)) = parse_set_value(&line) {
                        outputs.insert(key, value);
                    }
                }
                outputs
            })
        });
        let stderr = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| TaskError::ExecutionFailed(e.to_string()))?,
            _ = self.signal.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(task_instance_id = self.task_instance_id, error = %e, "Failed to kill shell task");
                }
                return Ok(TaskExecution::killed());
            }
        };

        let outputs = match stdout {
            Some(reader) => reader.await.unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let errors = match stderr {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(TaskExecution::success(outputs))
        } else if self.signal.is_cancelled() {
            Ok(TaskExecution::killed())
        } else {
            let tail = errors.trim();
            let message = if tail.is_empty() {
                format!("command exited with {status}")
            } else {
                format!("command exited with {status}: {tail}")
            };
            Ok(TaskExecution::failure(message))
        }
    }

    async fn cancel(&self) -> TaskResult<()> {
        self.signal.cancel();
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }
}

fn parse_set_value(line: &str) -> Option<(String, String)> {
    let inner = line.trim().strip_prefix("${setValue(")?.strip_suffix(")}")?;
    let (key, value) = inner.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NoopParams {
    sleep_ms: u64,
    fail: bool,
    outputs: BTreeMap<String, String>,
}

pub struct NoopTaskPlugin;

impl TaskPlugin for NoopTaskPlugin {
    fn kind(&self) -> TaskKind {
        TaskKind::Noop
    }

    fn create(&self, context: &TaskExecutionContext) -> TaskResult<Arc<dyn RunnableTask>> {
        let params: NoopParams = if context.params.is_null() {
            NoopParams::default()
        } else {
            serde_json::from_value(context.params.clone()).map_err(|e| TaskError::InvalidParams {
                kind: TaskKind::Noop.to_string(),
                reason: e.to_string(),
            })?
        };
        Ok(Arc::new(NoopTask {
            params,
            signal: CancelSignal::default(),
        }))
    }
}

/// Does nothing for `sleep_ms`, then succeeds with `outputs` (or fails if `fail`)
pub struct NoopTask {
    params: NoopParams,
    signal: CancelSignal,
}

#[async_trait]
impl RunnableTask for NoopTask {
    async fn init(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn submit(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn track_status(&self) -> TaskResult<TaskExecution> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.params.sleep_ms)) => {}
            _ = self.signal.cancelled() => return Ok(TaskExecution::killed()),
        }
        if self.params.fail {
            Ok(TaskExecution::failure("noop task configured to fail"))
        } else {
            Ok(TaskExecution::success(self.params.outputs.clone()))
        }
    }

    async fn cancel(&self) -> TaskResult<()> {
        self.signal.cancel();
        Ok(())
    }
}
