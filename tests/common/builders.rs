//! Harnesses and fixtures shared by the integration tests

use chrono::Utc;
use dagflow_core::config::{DagflowConfig, DispatchConfig};
use dagflow_core::dispatch::{ExecutorDispatcher, Host, RoundRobinSelector};
use dagflow_core::engine::{
    ExecutionStatus, InMemoryInstanceDao, RunnableContext, TaskDefinition, TaskDispatchLoop,
    TaskInstance, WorkflowDefinition, WorkflowEngine, WorkflowEvent, WorkflowHandle,
    WorkflowRunnableRepository,
};
use dagflow_core::registry::{
    FixedResourceProbe, HeartBeatProducer, NodeRole, ResourceThresholds, ResourceUsage,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::fakes::{
    DispatchRecord, RecordingExecutorManager, RecordingKiller, SlowSaveDao, SwitchableLiveness,
};

pub const MASTER_KEY: &str = "10.0.0.100:5678";

pub fn worker(n: u8) -> Host {
    Host::new(format!("10.0.0.{n}"), 1234)
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// `a -> b -> c ...`, all noop tasks
pub fn linear_workflow(names: &[&str]) -> WorkflowDefinition {
    let tasks = names
        .iter()
        .enumerate()
        .map(|(index, name)| {
            let code = index as i64 + 1;
            let task = TaskDefinition::new(code, *name, "noop");
            if index == 0 {
                task
            } else {
                task.with_pre_tasks([code - 1])
            }
        })
        .collect();
    WorkflowDefinition::new(1, "linear", tasks)
}

/// A workflow engine whose dispatches land in a [`RecordingExecutorManager`].
///
/// Tests play the worker by posting running/result events for recorded
/// dispatches.
pub struct EngineHarness {
    pub manager: Arc<RecordingExecutorManager>,
    pub killer: Arc<RecordingKiller>,
    pub liveness: Arc<SwitchableLiveness>,
    pub dao: Arc<InMemoryInstanceDao>,
    /// What the runnables save through; wraps `dao`
    pub saves: Arc<SlowSaveDao>,
    pub repository: Arc<WorkflowRunnableRepository>,
    pub engine: Arc<WorkflowEngine>,
}

impl EngineHarness {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self::with_failover_budget(hosts, 3)
    }

    pub fn with_failover_budget(hosts: Vec<Host>, max_failover_times: u32) -> Self {
        let manager = Arc::new(RecordingExecutorManager::with_hosts(hosts));
        let killer = Arc::new(RecordingKiller::default());
        let liveness = Arc::new(SwitchableLiveness::default());
        let dao = Arc::new(InMemoryInstanceDao::new());
        let saves = Arc::new(SlowSaveDao::new(dao.clone()));

        let dispatcher = Arc::new(ExecutorDispatcher::new(Arc::new(RoundRobinSelector::new())));
        dispatcher.register(manager.clone());
        let dispatch_config = DispatchConfig {
            max_task_commit_retries: 2,
            task_commit_interval_ms: 10,
            max_failover_times,
            ..DispatchConfig::default()
        };
        let context = Arc::new(RunnableContext {
            dao: saves.clone(),
            dispatch_loop: Arc::new(
                TaskDispatchLoop::new(dispatcher, &dispatch_config).with_killer(killer.clone()),
            ),
            killer: killer.clone(),
            liveness: liveness.clone(),
            max_failover_times,
            event_queue_size: 64,
        });
        let repository = Arc::new(WorkflowRunnableRepository::new());
        let engine = Arc::new(WorkflowEngine::new(context, repository.clone(), MASTER_KEY));

        Self {
            manager,
            killer,
            liveness,
            dao,
            saves,
            repository,
            engine,
        }
    }

    /// Wait for `count` accepted dispatches in total
    pub async fn dispatched(&self, count: usize) -> Vec<DispatchRecord> {
        let manager = self.manager.clone();
        assert!(
            wait_until(Duration::from_secs(2), || manager.dispatch_count() >= count).await,
            "expected {count} dispatches, saw {:?}",
            self.manager.dispatched()
        );
        self.manager.dispatched()
    }

    /// Wait until the named task has an accepted dispatch of at least `generation`
    pub async fn dispatch_of(&self, task_name: &str, generation: u32) -> DispatchRecord {
        let manager = self.manager.clone();
        let found = wait_until(Duration::from_secs(2), || {
            manager
                .last_for(task_name)
                .is_some_and(|record| record.generation >= generation)
        })
        .await;
        assert!(
            found,
            "task {task_name} was never dispatched with generation {generation}: {:?}",
            self.manager.dispatched()
        );
        self.manager
            .last_for(task_name)
            .expect("dispatch record present")
    }

    pub async fn wait_for_task(
        &self,
        handle: &WorkflowHandle,
        task_name: &str,
        state: ExecutionStatus,
    ) -> TaskInstance {
        let found = wait_until(Duration::from_secs(2), || {
            task_named(handle, task_name).is_some_and(|task| task.state == state)
        })
        .await;
        assert!(
            found,
            "task {task_name} never reached {state}: {:?}",
            task_named(handle, task_name)
        );
        task_named(handle, task_name).expect("task present")
    }
}

pub fn task_named(handle: &WorkflowHandle, task_name: &str) -> Option<TaskInstance> {
    handle
        .snapshot()
        .tasks
        .into_iter()
        .find(|task| task.name == task_name)
}

pub fn running(record: &DispatchRecord) -> WorkflowEvent {
    WorkflowEvent::TaskRunning {
        task_instance_id: record.task_instance_id,
        generation: record.generation,
        host: record.host.clone(),
        process_id: Some(4242),
        app_ids: Vec::new(),
        start_time: Utc::now(),
    }
}

pub fn completed(record: &DispatchRecord, var_pool: &[(&str, &str)]) -> WorkflowEvent {
    WorkflowEvent::TaskCompleted {
        task_instance_id: record.task_instance_id,
        generation: record.generation,
        host: record.host.clone(),
        end_time: Utc::now(),
        var_pool: var_pool
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

pub fn failed(record: &DispatchRecord) -> WorkflowEvent {
    WorkflowEvent::TaskFailed {
        task_instance_id: record.task_instance_id,
        generation: record.generation,
        host: record.host.clone(),
        end_time: Utc::now(),
        killed: false,
        reason: Some("exit code 1".to_string()),
    }
}

pub fn killed(record: &DispatchRecord) -> WorkflowEvent {
    WorkflowEvent::TaskFailed {
        task_instance_id: record.task_instance_id,
        generation: record.generation,
        host: record.host.clone(),
        end_time: Utc::now(),
        killed: true,
        reason: None,
    }
}

/// Configuration for in-process clusters: ephemeral ports and fast timers
pub fn cluster_config() -> DagflowConfig {
    let mut config = DagflowConfig::default();
    config.registry.session_timeout_ms = 600;
    config.registry.lease_reaper_interval_ms = 25;

    config.master.listen_port = 0;
    config.master.web_bind_address = "127.0.0.1:0".to_string();
    config.master.heartbeat_interval_ms = 100;
    config.master.host_warmup_ms = 0;
    config.master.failover_interval_ms = 50;
    config.master.max_cpu_load_avg = f64::MAX;
    config.master.reserved_memory_gb = 0.0;

    config.dispatch.request_timeout_ms = 1_000;
    config.dispatch.max_task_commit_retries = 20;
    config.dispatch.task_commit_interval_ms = 50;

    config.worker.listen_port = 0;
    config.worker.heartbeat_interval_ms = 100;
    config.worker.exec_threads = 8;
    config.worker.max_cpu_load_avg = f64::MAX;
    config.worker.reserved_memory_gb = 0.0;
    config.worker.ack_retry_interval_ms = 100;
    config.worker.report_timeout_ms = 500;
    config
}

pub fn idle_probe() -> Arc<FixedResourceProbe> {
    Arc::new(FixedResourceProbe(ResourceUsage {
        cpu_usage: 0.1,
        memory_usage: 0.2,
        load_average: 0.5,
        available_memory_gb: 8.0,
    }))
}

/// Registry value for a healthy node of the given role
pub fn encoded_heartbeat(host: &Host, role: NodeRole) -> String {
    HeartBeatProducer::new(
        host.key(),
        idle_probe(),
        ResourceThresholds {
            max_cpu_load_avg: f64::MAX,
            reserved_memory_gb: 0.0,
        },
        Arc::new(move || role.clone()),
    )
    .produce()
    .encode()
    .expect("heartbeat encodes")
}

pub fn worker_role() -> NodeRole {
    NodeRole::Worker {
        worker_group: "default".to_string(),
        host_weight: 100,
        worker_exec_threads: 8,
        running_task_count: 0,
    }
}
