//! # Worker Task Executor
//!
//! Accepts dispatched task instances, runs them on a bounded set of exec
//! slots and reports progress back to the dispatching master.
//!
//! A master that lost the reply to a dispatch sends the same attempt again,
//! so repeats of a running or finished attempt are accepted without running
//! it twice. A master that gave up on this worker revokes the attempt
//! instead: it is cancelled if it runs here and refused if its request
//! arrives late. Both are remembered for [`SETTLED_TTL`].

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::errors::TaskError;
use super::message_retry::{MessageRetryRunner, TaskReport};
use super::plugin::{RunnableTask, TaskExecution, TaskPluginRegistry};
use crate::dispatch::host::Host;
use crate::registry::heartbeat::HeartBeatProducer;
use crate::remote::messages::{
    TaskDispatchRequest, TaskDispatchResponse, TaskExecuteResult, TaskExecuteRunning,
    TaskExecutionContext, TaskKillResponse,
};

pub const SETTLED_TTL: Duration = Duration::from_secs(600);

/// How an attempt left this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Finished,
    Revoked,
}

struct RunningTask {
    generation: u32,
    task: Option<Arc<dyn RunnableTask>>,
}

pub struct WorkerTaskExecutor {
    /// Address this worker reports from
    host: Host,
    plugins: Arc<TaskPluginRegistry>,
    reports: Arc<MessageRetryRunner>,
    producer: HeartBeatProducer,
    exec_slots: Arc<Semaphore>,
    exec_threads: usize,
    /// Shared with the heartbeat role source
    running_count: Arc<AtomicUsize>,
    running: DashMap<i64, RunningTask>,
    /// Finished or revoked (task instance, generation) attempts
    settled: DashMap<(i64, u32), (Settlement, Instant)>,
}

impl WorkerTaskExecutor {
    pub fn new(
        host: Host,
        plugins: Arc<TaskPluginRegistry>,
        reports: Arc<MessageRetryRunner>,
        producer: HeartBeatProducer,
        exec_threads: usize,
        running_count: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            host,
            plugins,
            reports,
            producer,
            exec_slots: Arc::new(Semaphore::new(exec_threads)),
            exec_threads,
            running_count,
            running: DashMap::new(),
            settled: DashMap::new(),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, task_instance_id: i64) -> bool {
        self.running.contains_key(&task_instance_id)
    }

    /// Decide on a dispatch request; accepted tasks start in the background
    pub async fn accept(self: &Arc<Self>, request: TaskDispatchRequest) -> TaskDispatchResponse {
        let context = request.context;
        let task_instance_id = context.task_instance_id;

        let settlement = self
            .settled
            .get(&(task_instance_id, context.generation))
            .map(|settled| settled.0);
        match settlement {
            Some(Settlement::Revoked) => {
                return self.reject(
                    task_instance_id,
                    format!("attempt {} was revoked", context.generation),
                )
            }
            Some(Settlement::Finished) => {
                debug!(task_instance_id = task_instance_id, "Duplicate dispatch, already finished");
                return TaskDispatchResponse::accepted(task_instance_id);
            }
            None => {}
        }

        let duplicate = self
            .running
            .get(&task_instance_id)
            .is_some_and(|running| running.generation == context.generation);
        if duplicate {
            debug!(task_instance_id = task_instance_id, "Duplicate dispatch, already running");
            return TaskDispatchResponse::accepted(task_instance_id);
        }

        if self.producer.produce().is_busy() {
            return self.reject(task_instance_id, "worker is busy".to_string());
        }
        let Ok(permit) = Arc::clone(&self.exec_slots).try_acquire_owned() else {
            return self.reject(
                task_instance_id,
                format!("all {} exec slots are in use", self.exec_threads),
            );
        };
        let master: Host = match request.master_address.parse() {
            Ok(master) => master,
            Err(_) => {
                return self.reject(
                    task_instance_id,
                    format!("invalid master address '{}'", request.master_address),
                )
            }
        };

        let task = self.plugins.create(&context);
        let previous = self.running.insert(
            task_instance_id,
            RunningTask {
                generation: context.generation,
                task: task.as_ref().ok().cloned(),
            },
        );
        if let Some(stale) = previous.and_then(|running| running.task) {
            // A newer attempt supersedes whatever is still running here
            let _ = stale.cancel().await;
        }
        self.running_count.fetch_add(1, Ordering::SeqCst);

        info!(
            task_instance_id = task_instance_id,
            workflow_instance_id = context.workflow_instance_id,
            kind = %context.task_kind,
            generation = context.generation,
            master = %master,
            "Accepted task"
        );
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run(context, master, task, permit).await;
        });
        TaskDispatchResponse::accepted(task_instance_id)
    }

    /// Cancel a running task; the result report follows from the run itself.
    ///
    /// With a generation, only that attempt is cancelled and it is refused
    /// from now on.
    pub async fn kill(&self, task_instance_id: i64, generation: Option<u32>) -> TaskKillResponse {
        if let Some(generation) = generation {
            self.settle(task_instance_id, generation, Settlement::Revoked);
            info!(
                task_instance_id = task_instance_id,
                generation = generation,
                "Attempt revoked"
            );
        }
        let task = self
            .running
            .get(&task_instance_id)
            .filter(|running| generation.map_or(true, |g| g == running.generation))
            .and_then(|running| running.task.clone());

        match task {
            Some(task) => {
                if let Err(e) = task.cancel().await {
                    warn!(task_instance_id = task_instance_id, error = %e, "Cancel failed");
                }
                info!(task_instance_id = task_instance_id, "Kill requested");
                TaskKillResponse {
                    task_instance_id,
                    killed: true,
                    process_id: task.process_id(),
                    app_ids: task.app_ids(),
                }
            }
            None => TaskKillResponse {
                task_instance_id,
                killed: false,
                process_id: None,
                app_ids: Vec::new(),
            },
        }
    }

    fn is_revoked(&self, task_instance_id: i64, generation: u32) -> bool {
        self.settled
            .get(&(task_instance_id, generation))
            .is_some_and(|settled| settled.0 == Settlement::Revoked)
    }

    /// A revocation is never downgraded to finished
    fn settle(&self, task_instance_id: i64, generation: u32, settlement: Settlement) {
        let now = Instant::now();
        self.settled
            .retain(|_, (_, settled_at)| now.duration_since(*settled_at) < SETTLED_TTL);
        self.settled
            .entry((task_instance_id, generation))
            .and_modify(|(current, settled_at)| {
                if *current != Settlement::Revoked {
                    *current = settlement;
                }
                *settled_at = now;
            })
            .or_insert((settlement, now));
    }

    fn reject(&self, task_instance_id: i64, reason: String) -> TaskDispatchResponse {
        info!(task_instance_id = task_instance_id, reason = %reason, "Rejected task");
        TaskDispatchResponse::rejected(task_instance_id, reason)
    }

    async fn run(
        self: Arc<Self>,
        context: TaskExecutionContext,
        master: Host,
        task: Result<Arc<dyn RunnableTask>, TaskError>,
        _permit: OwnedSemaphorePermit,
    ) {
        let task_instance_id = context.task_instance_id;
        let generation = context.generation;

        let (execution, process_id, app_ids) = match task {
            Ok(task) => {
                let execution = self.drive(&context, &master, &task).await;
                (execution, task.process_id(), task.app_ids())
            }
            Err(e) => (TaskExecution::failure(e.to_string()), None, Vec::new()),
        };

        self.running
            .remove_if(&task_instance_id, |_, running| running.generation == generation);
        self.running_count.fetch_sub(1, Ordering::SeqCst);
        if self.is_revoked(task_instance_id, generation) {
            info!(
                task_instance_id = task_instance_id,
                generation = generation,
                "Revoked attempt ended, not reporting"
            );
            return;
        }
        self.settle(task_instance_id, generation, Settlement::Finished);

        info!(
            task_instance_id = task_instance_id,
            outcome = ?execution.outcome,
            "Task finished"
        );
        let result = TaskExecuteResult {
            task_instance_id,
            workflow_instance_id: context.workflow_instance_id,
            generation,
            host: self.host.key(),
            outcome: execution.outcome,
            end_time: Utc::now(),
            process_id,
            app_ids,
            var_pool: execution.var_pool,
            message: execution.message,
        };
        self.reports.send(&master, TaskReport::Result(result)).await;
    }

    async fn drive(
        &self,
        context: &TaskExecutionContext,
        master: &Host,
        task: &Arc<dyn RunnableTask>,
    ) -> TaskExecution {
        if let Err(e) = task.init().await {
            return TaskExecution::failure(e.to_string());
        }
        if let Err(e) = task.submit().await {
            return TaskExecution::failure(e.to_string());
        }

        let running = TaskExecuteRunning {
            task_instance_id: context.task_instance_id,
            workflow_instance_id: context.workflow_instance_id,
            generation: context.generation,
            host: self.host.key(),
            process_id: task.process_id(),
            app_ids: task.app_ids(),
            start_time: Utc::now(),
        };
        self.reports.send(master, TaskReport::Running(running)).await;

        match task.track_status().await {
            Ok(execution) => execution,
            Err(e) => TaskExecution::failure(e.to_string()),
        }
    }
}
