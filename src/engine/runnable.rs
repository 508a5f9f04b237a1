//! # Workflow Execution Runnable
//!
//! One runnable per in-flight workflow instance. It owns the instance and its
//! task instances outright and consumes a private queue one event at a time,
//! so no task state is ever touched from two places at once. Dispatch outcomes,
//! worker reports, timers, node-down notices and operator commands all arrive
//! as [`WorkflowEvent`]s on that queue.
//!
//! After each event the runnable submits newly ready tasks, checks whether the
//! workflow has settled, saves the instance through the DAO and publishes a
//! [`WorkflowSnapshot`] for readers. The loop ends when the workflow reaches a
//! terminal state.
//!
//! Worker reports are only believed from the host the current attempt was
//! dispatched to. A report that arrives before the dispatch outcome is held
//! until the outcome names the host, then replayed or dropped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::dao::InstanceDao;
use super::dispatch_loop::TaskDispatchLoop;
use super::errors::{EngineError, EngineResult};
use super::event::{ControlCommand, TaskEvent, WorkflowEvent};
use super::state::ExecutionStatus;
use super::state_machine::determine_target_state;
use super::task_instance::TaskInstance;
use super::workflow::{TimeoutStrategy, WorkflowInstance};
use crate::dispatch::context::{ExecutionContext, ExecutorType};
use crate::dispatch::host::Host;
use crate::logging::{log_dispatch_operation, log_state_transition};
use crate::registry::node_manager::ServerNodeManager;

/// Asks a worker to terminate a task instance
#[async_trait]
pub trait TaskKiller: Send + Sync {
    async fn kill(&self, host: &Host, task_instance_id: i64);

    /// Withdraw one dispatch attempt whose outcome is unknown: stop it if it
    /// runs on `host` and have `host` refuse it if it arrives later
    async fn revoke(&self, host: &Host, task_instance_id: i64, _generation: u32) {
        self.kill(host, task_instance_id).await;
    }
}

/// Current view of which workers are alive
pub trait WorkerLiveness: Send + Sync {
    fn is_worker_alive(&self, host: &Host) -> bool;
}

impl WorkerLiveness for ServerNodeManager {
    fn is_worker_alive(&self, host: &Host) -> bool {
        ServerNodeManager::is_worker_alive(self, host)
    }
}

/// Collaborators shared by every runnable of a master
pub struct RunnableContext {
    pub dao: Arc<dyn InstanceDao>,
    pub dispatch_loop: Arc<TaskDispatchLoop>,
    pub killer: Arc<dyn TaskKiller>,
    pub liveness: Arc<dyn WorkerLiveness>,
    pub max_failover_times: u32,
    pub event_queue_size: usize,
}

/// Read-only copy of a workflow instance published after every event
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow_instance_id: i64,
    pub name: String,
    pub state: ExecutionStatus,
    pub host: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskInstance>,
}

impl WorkflowSnapshot {
    pub fn from_instance(instance: &WorkflowInstance) -> Self {
        Self {
            workflow_instance_id: instance.id,
            name: instance.definition.name.clone(),
            state: instance.state,
            host: instance.host.clone(),
            start_time: instance.start_time,
            end_time: instance.end_time,
            tasks: instance.task_instances.values().cloned().collect(),
        }
    }

    /// Number of task instances per state
    pub fn task_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for task in &self.tasks {
            *counts.entry(task.state.to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn task(&self, task_instance_id: i64) -> Option<&TaskInstance> {
        self.tasks.iter().find(|task| task.id == task_instance_id)
    }
}

/// Sending side of a runnable
#[derive(Clone)]
pub struct WorkflowHandle {
    workflow_instance_id: i64,
    sender: mpsc::Sender<WorkflowEvent>,
    snapshot: Arc<RwLock<WorkflowSnapshot>>,
    state: watch::Receiver<ExecutionStatus>,
}

impl WorkflowHandle {
    pub fn workflow_instance_id(&self) -> i64 {
        self.workflow_instance_id
    }

    pub async fn post(&self, event: WorkflowEvent) -> EngineResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| EngineError::QueueClosed(self.workflow_instance_id))
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.snapshot.read().clone()
    }

    pub fn state(&self) -> ExecutionStatus {
        *self.state.borrow()
    }

    /// Wait until the workflow state satisfies `predicate`
    pub async fn wait_for_state<F>(&self, predicate: F) -> ExecutionStatus
    where
        F: Fn(ExecutionStatus) -> bool,
    {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if predicate(current) {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingControl {
    Pause,
    Stop,
    Kill,
}

pub struct WorkflowExecutionRunnable {
    instance: WorkflowInstance,
    context: Arc<RunnableContext>,
    pending_control: Option<PendingControl>,
    /// Reports that arrived before their dispatch outcome, by task code
    deferred: HashMap<i64, Vec<WorkflowEvent>>,
    /// Own queue, for timers and dispatch outcomes
    events: mpsc::Sender<WorkflowEvent>,
    snapshot: Arc<RwLock<WorkflowSnapshot>>,
    state_tx: watch::Sender<ExecutionStatus>,
}

impl WorkflowExecutionRunnable {
    pub fn new(
        instance: WorkflowInstance,
        context: Arc<RunnableContext>,
    ) -> (Self, WorkflowHandle, mpsc::Receiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::channel(context.event_queue_size.max(1));
        let snapshot = Arc::new(RwLock::new(WorkflowSnapshot::from_instance(&instance)));
        let (state_tx, state_rx) = watch::channel(instance.state);

        let handle = WorkflowHandle {
            workflow_instance_id: instance.id,
            sender: sender.clone(),
            snapshot: Arc::clone(&snapshot),
            state: state_rx,
        };
        let runnable = Self {
            instance,
            context,
            pending_control: None,
            deferred: HashMap::new(),
            events: sender,
            snapshot,
            state_tx,
        };
        (runnable, handle, receiver)
    }

    /// Consume events until the workflow is terminal; returns the final instance
    pub async fn run(mut self, mut receiver: mpsc::Receiver<WorkflowEvent>) -> WorkflowInstance {
        info!(
            workflow_instance_id = self.instance.id,
            name = %self.instance.definition.name,
            "Workflow runnable started"
        );

        while let Some(event) = receiver.recv().await {
            debug!(
                workflow_instance_id = self.instance.id,
                event_type = event.event_type(),
                "Processing workflow event"
            );
            self.handle(event).await;
            self.submit_ready_tasks().await;
            self.settle().await;
            self.persist().await;
            self.publish();

            if self.instance.state.is_terminal() {
                break;
            }
        }

        info!(
            workflow_instance_id = self.instance.id,
            state = %self.instance.state,
            "Workflow runnable finished"
        );
        self.instance
    }

    async fn handle(&mut self, event: WorkflowEvent) {
        if let Some((task_instance_id, generation)) = event.task_scope() {
            match self.instance.task_by_instance_id(task_instance_id) {
                None => {
                    warn!(
                        workflow_instance_id = self.instance.id,
                        task_instance_id = task_instance_id,
                        "Event for unknown task instance, dropping"
                    );
                    return;
                }
                Some(task) if task.generation != generation => {
                    debug!(
                        task_instance_id = task_instance_id,
                        event_generation = generation,
                        current_generation = task.generation,
                        event_type = event.event_type(),
                        "Stale event, dropping"
                    );
                    return;
                }
                Some(task) => {
                    if let Some(reporter) = event.report_host() {
                        match &task.host {
                            None if task.state == ExecutionStatus::SubmittedSuccess => {
                                debug!(
                                    task_instance_id = task_instance_id,
                                    host = %reporter,
                                    event_type = event.event_type(),
                                    "Report ahead of its dispatch outcome, holding"
                                );
                                let code = task.task_code;
                                self.deferred.entry(code).or_default().push(event);
                                return;
                            }
                            Some(host) if host == reporter => {}
                            _ => {
                                debug!(
                                    task_instance_id = task_instance_id,
                                    host = %reporter,
                                    event_type = event.event_type(),
                                    "Report from a host this attempt is not on, dropping"
                                );
                                return;
                            }
                        }
                    }
                }
            }
        }

        self.apply(event);
    }

    fn apply(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::Start => self.on_start(),
            WorkflowEvent::TaskDispatched {
                task_instance_id,
                host,
                ..
            } => self.on_task_dispatched(task_instance_id, host),
            WorkflowEvent::TaskRunning {
                task_instance_id,
                host,
                process_id,
                app_ids,
                start_time,
                ..
            } => self.on_task_running(task_instance_id, host, process_id, app_ids, start_time),
            WorkflowEvent::TaskCompleted {
                task_instance_id,
                end_time,
                var_pool,
                ..
            } => self.on_task_completed(task_instance_id, end_time, var_pool),
            WorkflowEvent::TaskFailed {
                task_instance_id,
                end_time,
                killed,
                reason,
                ..
            } => self.on_task_failed(task_instance_id, end_time, killed, reason),
            WorkflowEvent::DispatchFailed {
                task_instance_id,
                reason,
                ..
            } => self.on_dispatch_failed(task_instance_id, reason),
            WorkflowEvent::NodeDown { host } => self.on_node_down(&host),
            WorkflowEvent::Control(command) => self.on_control(command),
            WorkflowEvent::RetryTimerFired {
                task_instance_id, ..
            } => self.on_retry_timer(task_instance_id),
            WorkflowEvent::TaskTimeout {
                task_instance_id, ..
            } => self.on_task_timeout(task_instance_id),
        }
    }

    fn on_start(&mut self) {
        match self.instance.state {
            ExecutionStatus::SubmittedSuccess => {
                self.instance.start_time = Some(Utc::now());
                self.set_workflow_state(ExecutionStatus::RunningExecution, "start");
            }
            ExecutionStatus::RunningExecution => {
                // Recovered instance: re-dispatch what the previous owner left behind
                let orphaned: Vec<i64> = self
                    .instance
                    .task_instances
                    .values()
                    .filter(|task| task.state == ExecutionStatus::NeedFaultTolerance)
                    .map(|task| task.task_code)
                    .collect();
                info!(
                    workflow_instance_id = self.instance.id,
                    orphaned = orphaned.len(),
                    "Recovering workflow instance"
                );
                for code in orphaned {
                    if self.transition(code, TaskEvent::Recover) {
                        self.dispatch_task(code);
                    }
                }
            }
            ExecutionStatus::Pause | ExecutionStatus::Stop => {}
            other => warn!(
                workflow_instance_id = self.instance.id,
                state = %other,
                "Start ignored in current workflow state"
            ),
        }
    }

    fn on_task_dispatched(&mut self, task_instance_id: i64, host: Host) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        let held = self.deferred.remove(&code).unwrap_or_default();

        if !self.context.liveness.is_worker_alive(&host) {
            warn!(
                task_instance_id = task_instance_id,
                host = %host,
                "Task dispatched to a worker that has since gone down"
            );
            self.set_task_host(code, host);
            self.failover_task(code);
            return;
        }

        if !self.transition(code, TaskEvent::Dispatch) {
            return;
        }
        self.set_task_host(code, host.clone());
        if self.is_stopping() {
            self.kill_on_host(host.clone(), task_instance_id);
        }

        for report in held {
            if report.report_host() == Some(&host) {
                self.apply(report);
            } else {
                debug!(
                    task_instance_id = task_instance_id,
                    host = ?report.report_host(),
                    "Dropping held report from a host the dispatch did not land on"
                );
            }
        }
    }

    fn on_task_running(
        &mut self,
        task_instance_id: i64,
        host: Host,
        process_id: Option<u32>,
        app_ids: Vec<String>,
        start_time: DateTime<Utc>,
    ) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        if !self.transition(code, TaskEvent::Ack) {
            return;
        }

        let timeout = self
            .instance
            .definition
            .task(code)
            .and_then(|definition| definition.timeout_ms);
        let Some(task) = self.instance.task_instances.get_mut(&code) else {
            return;
        };
        task.start_time = Some(start_time);
        task.process_id = process_id;
        task.app_ids = app_ids;
        let generation = task.generation;

        if let Some(timeout_ms) = timeout {
            self.schedule(
                Duration::from_millis(timeout_ms),
                WorkflowEvent::TaskTimeout {
                    task_instance_id,
                    generation,
                },
            );
        }
        if self.is_stopping() {
            self.kill_on_host(host, task_instance_id);
        }
    }

    fn on_task_completed(
        &mut self,
        task_instance_id: i64,
        end_time: DateTime<Utc>,
        var_pool: BTreeMap<String, String>,
    ) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        if !self.transition(code, TaskEvent::Succeed) {
            return;
        }
        self.instance
            .var_pool
            .extend(var_pool.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(task) = self.instance.task_instances.get_mut(&code) {
            task.end_time = Some(end_time);
            task.var_pool = var_pool;
        }
    }

    fn on_task_failed(
        &mut self,
        task_instance_id: i64,
        end_time: DateTime<Utc>,
        killed: bool,
        reason: Option<String>,
    ) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        let (max_retry_times, retry_interval_ms) = self
            .instance
            .definition
            .task(code)
            .map(|d| (d.max_retry_times, d.retry_interval_ms))
            .unwrap_or((0, 0));
        let retry_times = self.task(code).map(|t| t.retry_times).unwrap_or(0);

        let event = if killed {
            TaskEvent::Killed
        } else {
            TaskEvent::Fail {
                retry: retry_times < max_retry_times && self.pending_control.is_none(),
            }
        };
        if !self.transition(code, event) {
            return;
        }

        let Some(task) = self.instance.task_instances.get_mut(&code) else {
            return;
        };
        task.end_time = Some(end_time);
        task.message = reason;

        if event == (TaskEvent::Fail { retry: true }) {
            task.retry_times += 1;
            let generation = task.generation;
            info!(
                task_instance_id = task_instance_id,
                retry_times = task.retry_times,
                max_retry_times = max_retry_times,
                "Task failed, scheduling retry"
            );
            self.schedule(
                Duration::from_millis(retry_interval_ms),
                WorkflowEvent::RetryTimerFired {
                    task_instance_id,
                    generation,
                },
            );
        }
    }

    fn on_dispatch_failed(&mut self, task_instance_id: i64, reason: String) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        // Held reports belong to an attempt that never landed
        self.deferred.remove(&code);
        let event = match self.pending_control {
            Some(PendingControl::Pause) => TaskEvent::Pause,
            Some(PendingControl::Stop | PendingControl::Kill) => TaskEvent::Kill,
            None => TaskEvent::DispatchFail,
        };
        if self.transition(code, event) {
            if let Some(task) = self.instance.task_instances.get_mut(&code) {
                task.message = Some(reason);
                task.end_time = Some(Utc::now());
            }
        }
    }

    fn on_node_down(&mut self, host: &Host) {
        let affected: Vec<i64> = self
            .instance
            .task_instances
            .values()
            .filter(|task| {
                task.is_on_host(host)
                    && task.state.is_should_failover()
                    && task.state != ExecutionStatus::DelayExecution
            })
            .map(|task| task.task_code)
            .collect();

        if affected.is_empty() {
            debug!(
                workflow_instance_id = self.instance.id,
                host = %host,
                "Node down does not affect this workflow"
            );
            return;
        }
        for code in affected {
            self.failover_task(code);
        }
    }

    fn failover_task(&mut self, code: i64) {
        match self.pending_control {
            Some(PendingControl::Pause) => {
                self.transition(code, TaskEvent::Pause);
            }
            Some(PendingControl::Stop | PendingControl::Kill) => {
                self.transition(code, TaskEvent::Kill);
            }
            None => {
                let max = self.context.max_failover_times;
                let failover_times = self.task(code).map(|t| t.failover_times).unwrap_or(0);
                let budget_left = failover_times < max;
                if !self.transition(code, TaskEvent::Failover { budget_left }) {
                    return;
                }
                if budget_left {
                    if let Some(task) = self.instance.task_instances.get_mut(&code) {
                        task.failover_times += 1;
                    }
                    self.dispatch_task(code);
                } else if let Some(task) = self.instance.task_instances.get_mut(&code) {
                    task.message = Some(format!("failover budget of {max} exhausted"));
                    task.end_time = Some(Utc::now());
                }
            }
        }
    }

    fn on_control(&mut self, command: ControlCommand) {
        let state = self.instance.state;
        info!(
            workflow_instance_id = self.instance.id,
            command = command.name(),
            state = %state,
            "Control command received"
        );

        match command {
            ControlCommand::Pause => {
                if state != ExecutionStatus::RunningExecution || self.pending_control.is_some() {
                    warn!(workflow_instance_id = self.instance.id, state = %state, "Pause ignored");
                    return;
                }
                self.pending_control = Some(PendingControl::Pause);
                for code in self.codes_in(&[ExecutionStatus::DelayExecution]) {
                    self.transition(code, TaskEvent::Pause);
                }
            }
            ControlCommand::Stop | ControlCommand::Kill => {
                if state != ExecutionStatus::RunningExecution && !state.is_holding() {
                    warn!(workflow_instance_id = self.instance.id, state = %state, "Stop ignored");
                    return;
                }
                let pending = if command == ControlCommand::Kill {
                    PendingControl::Kill
                } else {
                    PendingControl::Stop
                };
                if self.pending_control != Some(PendingControl::Kill) {
                    self.pending_control = Some(pending);
                }
                if state.is_holding() {
                    // Held workflows have nothing running; settle applies the new state
                    self.instance.state = ExecutionStatus::RunningExecution;
                }

                for code in self.codes_in(&[
                    ExecutionStatus::DelayExecution,
                    ExecutionStatus::NeedFaultTolerance,
                ]) {
                    self.transition(code, TaskEvent::Kill);
                }
                let running: Vec<(Host, i64)> = self
                    .instance
                    .task_instances
                    .values()
                    .filter(|task| {
                        matches!(
                            task.state,
                            ExecutionStatus::Dispatch | ExecutionStatus::RunningExecution
                        )
                    })
                    .filter_map(|task| task.host.clone().map(|host| (host, task.id)))
                    .collect();
                for (host, task_instance_id) in running {
                    self.kill_on_host(host, task_instance_id);
                }
            }
            ControlCommand::Resume => {
                if !state.is_holding() {
                    warn!(workflow_instance_id = self.instance.id, state = %state, "Resume ignored");
                    return;
                }
                self.pending_control = None;
                self.set_workflow_state(ExecutionStatus::RunningExecution, "resume");
                self.instance.end_time = None;

                let unfinished = self.codes_in(&[
                    ExecutionStatus::Pause,
                    ExecutionStatus::Stop,
                    ExecutionStatus::Kill,
                    ExecutionStatus::Failure,
                    ExecutionStatus::NeedFaultTolerance,
                ]);
                for code in unfinished {
                    if self.transition(code, TaskEvent::Recover) {
                        self.dispatch_task(code);
                    }
                }
            }
            ControlCommand::ForceTaskSuccess { task_instance_id } => {
                if !state.is_holding() {
                    warn!(
                        workflow_instance_id = self.instance.id,
                        state = %state,
                        "Force success is only allowed on a paused or stopped workflow"
                    );
                    return;
                }
                if let Some(code) = self.instance.task_code_of(task_instance_id) {
                    self.transition(code, TaskEvent::ForceSuccess);
                }
            }
        }
    }

    fn on_retry_timer(&mut self, task_instance_id: i64) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        if self.task(code).map(|t| t.state) != Some(ExecutionStatus::DelayExecution) {
            debug!(task_instance_id = task_instance_id, "Retry timer no longer relevant");
            return;
        }
        match self.pending_control {
            Some(PendingControl::Pause) => {
                self.transition(code, TaskEvent::Pause);
            }
            Some(PendingControl::Stop | PendingControl::Kill) => {
                self.transition(code, TaskEvent::Kill);
            }
            None => {
                if self.transition(code, TaskEvent::RetryTimer) {
                    self.dispatch_task(code);
                }
            }
        }
    }

    fn on_task_timeout(&mut self, task_instance_id: i64) {
        let Some(code) = self.instance.task_code_of(task_instance_id) else {
            return;
        };
        let Some(task) = self.task(code) else { return };
        if task.state != ExecutionStatus::RunningExecution {
            return;
        }
        let host = task.host.clone();
        let strategy = self
            .instance
            .definition
            .task(code)
            .map(|d| d.timeout_strategy)
            .unwrap_or_default();

        match strategy {
            TimeoutStrategy::Warn => warn!(
                workflow_instance_id = self.instance.id,
                task_instance_id = task_instance_id,
                "Task exceeded its timeout"
            ),
            TimeoutStrategy::Failed => {
                if let Some(host) = host {
                    self.kill_on_host(host, task_instance_id);
                }
                if self.transition(code, TaskEvent::Timeout) {
                    if let Some(task) = self.instance.task_instances.get_mut(&code) {
                        task.message = Some("task timed out".to_string());
                        task.end_time = Some(Utc::now());
                    }
                }
            }
        }
    }

    /// Create and dispatch instances for tasks whose predecessors all succeeded
    async fn submit_ready_tasks(&mut self) {
        if self.instance.state != ExecutionStatus::RunningExecution
            || self.pending_control.is_some()
            || self.instance.has_failed_tasks()
        {
            return;
        }

        for code in self.instance.ready_task_codes() {
            let id = match self.context.dao.next_task_instance_id().await {
                Ok(id) => id,
                Err(e) => {
                    error!(
                        workflow_instance_id = self.instance.id,
                        task_code = code,
                        error = %e,
                        "Failed to allocate task instance"
                    );
                    continue;
                }
            };
            let Some(definition) = self.instance.definition.task(code) else {
                continue;
            };
            let task = TaskInstance::new(id, definition, self.instance.id);
            self.instance.task_instances.insert(code, task);
            self.dispatch_task(code);
        }
    }

    /// Move a finished-or-held workflow to its resting state
    async fn settle(&mut self) {
        if self.instance.state != ExecutionStatus::RunningExecution
            || self.instance.has_active_tasks()
        {
            return;
        }

        match self.pending_control.take() {
            Some(PendingControl::Pause) => {
                self.set_workflow_state(ExecutionStatus::Pause, "pause")
            }
            Some(PendingControl::Stop) => self.set_workflow_state(ExecutionStatus::Stop, "stop"),
            Some(PendingControl::Kill) => self.set_workflow_state(ExecutionStatus::Kill, "kill"),
            None => {
                if self.instance.all_tasks_succeeded() {
                    self.set_workflow_state(ExecutionStatus::Success, "all_tasks_succeeded");
                } else if self.instance.has_failed_tasks() {
                    self.set_workflow_state(ExecutionStatus::Failure, "task_failed");
                } else {
                    self.submit_ready_tasks().await;
                    if !self.instance.has_active_tasks() {
                        error!(
                            workflow_instance_id = self.instance.id,
                            "No task can make progress"
                        );
                        self.set_workflow_state(ExecutionStatus::Failure, "stalled");
                    }
                }
            }
        }
    }

    fn dispatch_task(&mut self, code: i64) {
        let var_pool = self.instance.var_pool.clone();
        let Some(definition) = self.instance.definition.task(code).cloned() else {
            return;
        };
        let Some(task) = self.instance.task_instances.get_mut(&code) else {
            return;
        };
        task.begin_attempt();
        self.deferred.remove(&code);

        log_dispatch_operation(
            "submit",
            task.id,
            &definition.worker_group,
            None,
            "submitted",
            Some(&format!("generation {}", task.generation)),
        );
        let context = ExecutionContext::new(
            ExecutorType::Worker,
            task.execution_context(&definition, &var_pool),
        );
        self.context.dispatch_loop.spawn(context, self.events.clone());
    }

    fn transition(&mut self, code: i64, event: TaskEvent) -> bool {
        let workflow_instance_id = self.instance.id;
        let Some(task) = self.instance.task_instances.get_mut(&code) else {
            return false;
        };
        match determine_target_state(task.state, &event) {
            Ok(target) => {
                let from = task.state;
                task.state = target;
                log_state_transition(
                    "task_instance",
                    task.id,
                    &from.to_string(),
                    &target.to_string(),
                    event.event_type(),
                );
                true
            }
            Err(e) => {
                warn!(
                    workflow_instance_id = workflow_instance_id,
                    task_instance_id = task.id,
                    error = %e,
                    "Dropping event with no valid transition"
                );
                false
            }
        }
    }

    fn set_workflow_state(&mut self, target: ExecutionStatus, reason: &str) {
        let from = self.instance.state;
        self.instance.state = target;
        if target.is_terminal() || target.is_holding() {
            self.instance.end_time = Some(Utc::now());
        }
        log_state_transition(
            "workflow_instance",
            self.instance.id,
            &from.to_string(),
            &target.to_string(),
            reason,
        );
    }

    fn set_task_host(&mut self, code: i64, host: Host) {
        if let Some(task) = self.instance.task_instances.get_mut(&code) {
            task.host = Some(host);
        }
    }

    fn task(&self, code: i64) -> Option<&TaskInstance> {
        self.instance.task_instances.get(&code)
    }

    fn codes_in(&self, states: &[ExecutionStatus]) -> Vec<i64> {
        self.instance
            .task_instances
            .values()
            .filter(|task| states.contains(&task.state))
            .map(|task| task.task_code)
            .collect()
    }

    fn is_stopping(&self) -> bool {
        matches!(
            self.pending_control,
            Some(PendingControl::Stop | PendingControl::Kill)
        )
    }

    fn kill_on_host(&self, host: Host, task_instance_id: i64) {
        let killer = Arc::clone(&self.context.killer);
        tokio::spawn(async move {
            killer.kill(&host, task_instance_id).await;
        });
    }

    fn schedule(&self, delay: Duration, event: WorkflowEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event).await;
        });
    }

    async fn persist(&self) {
        if let Err(e) = self.context.dao.save_workflow_instance(&self.instance).await {
            error!(
                workflow_instance_id = self.instance.id,
                error = %e,
                "Failed to persist workflow instance"
            );
        }
    }

    fn publish(&self) {
        *self.snapshot.write() = WorkflowSnapshot::from_instance(&self.instance);
        self.state_tx.send_replace(self.instance.state);
    }
}
