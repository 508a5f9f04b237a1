//! In-process stand-ins for workers, kill delivery and liveness

use async_trait::async_trait;
use dagflow_core::dispatch::{DispatchError, ExecutionContext, ExecutorManager, ExecutorType, Host};
use dagflow_core::engine::{
    DaoResult, InMemoryInstanceDao, InstanceDao, TaskKiller, WorkerLiveness, WorkflowDefinition,
    WorkflowInstance,
};
use dagflow_core::remote::RemotingError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a fake worker received
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub task_instance_id: i64,
    pub task_name: String,
    pub generation: u32,
    pub host: Host,
    pub var_pool: BTreeMap<String, String>,
}

/// Executor manager that accepts everything it is given, unless told to
/// reject or time out, and remembers every dispatch a worker received.
#[derive(Default)]
pub struct RecordingExecutorManager {
    hosts: Mutex<Vec<Host>>,
    script: Mutex<VecDeque<Scripted>>,
    dispatched: Mutex<Vec<DispatchRecord>>,
}

/// Outcome forced on an upcoming dispatch attempt
enum Scripted {
    Reject(String),
    TimeOut,
}

impl RecordingExecutorManager {
    pub fn with_hosts(hosts: Vec<Host>) -> Self {
        Self {
            hosts: Mutex::new(hosts),
            ..Default::default()
        }
    }

    pub fn set_hosts(&self, hosts: Vec<Host>) {
        *self.hosts.lock() = hosts;
    }

    /// Reject the next `count` dispatch attempts
    pub fn reject_next(&self, count: usize, reason: &str) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Scripted::Reject(reason.to_string()));
        }
    }

    /// Take the next `count` dispatches but let the master's wait for the
    /// reply time out, as when the worker's answer is lost
    pub fn time_out_next(&self, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Scripted::TimeOut);
        }
    }

    pub fn dispatched(&self) -> Vec<DispatchRecord> {
        self.dispatched.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Latest accepted dispatch of the named task
    pub fn last_for(&self, task_name: &str) -> Option<DispatchRecord> {
        self.dispatched
            .lock()
            .iter()
            .rev()
            .find(|record| record.task_name == task_name)
            .cloned()
    }
}

#[async_trait]
impl ExecutorManager for RecordingExecutorManager {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Worker
    }

    fn candidate_hosts(&self, _context: &ExecutionContext) -> Vec<Host> {
        self.hosts.lock().clone()
    }

    async fn execute(&self, context: &ExecutionContext) -> Result<(), DispatchError> {
        let host = context
            .host
            .clone()
            .ok_or_else(|| DispatchError::UnusableHost {
                host: "<none>".to_string(),
            })?;
        let scripted = self.script.lock().pop_front();
        let timed_out = match scripted {
            Some(Scripted::Reject(reason)) => {
                return Err(DispatchError::Rejected {
                    host: host.key(),
                    task_instance_id: context.task_instance_id(),
                    reason,
                })
            }
            Some(Scripted::TimeOut) => true,
            None => false,
        };
        self.dispatched.lock().push(DispatchRecord {
            task_instance_id: context.task_instance_id(),
            task_name: context.task.task_name.clone(),
            generation: context.task.generation,
            host: host.clone(),
            var_pool: context.task.var_pool.clone(),
        });
        if timed_out {
            return Err(DispatchError::Remoting {
                host: host.key(),
                source: RemotingError::Timeout {
                    host: host.key(),
                    opaque: 0,
                    timeout: Duration::from_millis(10),
                },
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingKiller {
    kills: Mutex<Vec<(Host, i64)>>,
    revokes: Mutex<Vec<(Host, i64, u32)>>,
}

impl RecordingKiller {
    pub fn kills(&self) -> Vec<(Host, i64)> {
        self.kills.lock().clone()
    }

    pub fn revokes(&self) -> Vec<(Host, i64, u32)> {
        self.revokes.lock().clone()
    }
}

#[async_trait]
impl TaskKiller for RecordingKiller {
    async fn kill(&self, host: &Host, task_instance_id: i64) {
        self.kills.lock().push((host.clone(), task_instance_id));
    }

    async fn revoke(&self, host: &Host, task_instance_id: i64, generation: u32) {
        self.revokes
            .lock()
            .push((host.clone(), task_instance_id, generation));
    }
}

/// Every worker is alive unless marked dead
#[derive(Default)]
pub struct SwitchableLiveness {
    dead: Mutex<HashSet<Host>>,
}

impl SwitchableLiveness {
    pub fn mark_dead(&self, host: &Host) {
        self.dead.lock().insert(host.clone());
    }
}

impl WorkerLiveness for SwitchableLiveness {
    fn is_worker_alive(&self, host: &Host) -> bool {
        !self.dead.lock().contains(host)
    }
}

/// In-memory DAO whose saves can be slowed down, so tests can observe a
/// runnable between handling an event and publishing its snapshot
pub struct SlowSaveDao {
    inner: Arc<InMemoryInstanceDao>,
    save_delay_ms: AtomicU64,
    saves_started: AtomicUsize,
}

impl SlowSaveDao {
    pub fn new(inner: Arc<InMemoryInstanceDao>) -> Self {
        Self {
            inner,
            save_delay_ms: AtomicU64::new(0),
            saves_started: AtomicUsize::new(0),
        }
    }

    pub fn set_save_delay(&self, delay: Duration) {
        self.save_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn saves_started(&self) -> usize {
        self.saves_started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceDao for SlowSaveDao {
    async fn create_workflow_instance(
        &self,
        definition: &WorkflowDefinition,
        owner: &str,
    ) -> DaoResult<WorkflowInstance> {
        self.inner.create_workflow_instance(definition, owner).await
    }

    async fn next_task_instance_id(&self) -> DaoResult<i64> {
        self.inner.next_task_instance_id().await
    }

    async fn save_workflow_instance(&self, instance: &WorkflowInstance) -> DaoResult<()> {
        self.saves_started.fetch_add(1, Ordering::SeqCst);
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.save_workflow_instance(instance).await
    }

    async fn find_workflow_instance(&self, id: i64) -> DaoResult<Option<WorkflowInstance>> {
        self.inner.find_workflow_instance(id).await
    }

    async fn find_unfinished_by_host(&self, owner: &str) -> DaoResult<Vec<WorkflowInstance>> {
        self.inner.find_unfinished_by_host(owner).await
    }
}
