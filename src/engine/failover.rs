//! # Failover
//!
//! Reacts to nodes leaving the registry.
//!
//! [`WorkerFailoverListener`] turns a vanished worker into a node-down event
//! for every runnable; runnables with nothing on that worker ignore it. A vanished master leaves whole workflow instances without an owner;
//! [`MasterFailoverCoordinator`] takes a registry lock for that master, marks
//! its in-flight tasks as needing fault tolerance and resumes the instances
//! here.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::dao::InstanceDao;
use super::repository::WorkflowRunnableRepository;
use super::runnable::{TaskKiller, WorkerLiveness};
use super::state::ExecutionStatus;
use super::workflow_engine::WorkflowEngine;
use crate::dispatch::host::Host;
use crate::error::Result;
use crate::logging::{log_registry_operation, log_state_transition};
use crate::registry::node_manager::{NodeChange, NodeChangeListener};
use crate::registry::paths;
use crate::registry::store::Registry;

pub struct WorkerFailoverListener {
    repository: Arc<WorkflowRunnableRepository>,
}

impl WorkerFailoverListener {
    pub fn new(repository: Arc<WorkflowRunnableRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl NodeChangeListener for WorkerFailoverListener {
    async fn on_node_change(&self, change: &NodeChange) {
        if let NodeChange::WorkerRemoved { group, host } = change {
            let notified = self.repository.broadcast_node_down(host).await;
            info!(
                group = %group,
                host = %host,
                workflows = notified,
                "Worker removed, failing over its tasks"
            );
        }
    }

    fn listener_name(&self) -> &str {
        "worker_failover"
    }
}

#[derive(Clone)]
pub struct MasterFailoverCoordinator {
    self_host: Host,
    registry: Arc<dyn Registry>,
    dao: Arc<dyn InstanceDao>,
    engine: Arc<WorkflowEngine>,
    killer: Arc<dyn TaskKiller>,
    liveness: Arc<dyn WorkerLiveness>,
    /// Grace period before acting on a master removal
    failover_interval: Duration,
    lock_ttl: Duration,
}

impl MasterFailoverCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_host: Host,
        registry: Arc<dyn Registry>,
        dao: Arc<dyn InstanceDao>,
        engine: Arc<WorkflowEngine>,
        killer: Arc<dyn TaskKiller>,
        liveness: Arc<dyn WorkerLiveness>,
        failover_interval: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            self_host,
            registry,
            dao,
            engine,
            killer,
            liveness,
            failover_interval,
            lock_ttl,
        }
    }

    /// Take over every unfinished instance owned by `dead`.
    ///
    /// Returns how many instances were resumed here; zero when another master
    /// holds the failover lock.
    pub async fn failover_master(&self, dead: &Host) -> Result<usize> {
        let lock_path = paths::failover_lock_path(dead);
        let lease = self.registry.grant_lease(self.lock_ttl).await?;
        if !self.registry.try_lock(&lock_path, lease).await? {
            log_registry_operation("failover_lock", &lock_path, "held_elsewhere", None);
            self.registry.revoke_lease(lease).await?;
            return Ok(0);
        }
        log_registry_operation("failover_lock", &lock_path, "acquired", None);

        let outcome = self.take_over(dead).await;

        if let Err(e) = self.registry.unlock(&lock_path, lease).await {
            warn!(path = %lock_path, error = %e, "Failed to release failover lock");
        }
        if let Err(e) = self.registry.revoke_lease(lease).await {
            debug!(error = %e, "Failover lease already gone");
        }
        outcome
    }

    async fn on_master_removed(&self, dead: &Host) {
        tokio::time::sleep(self.failover_interval).await;
        match self.registry.exists(&paths::master_path(dead)).await {
            Ok(true) => {
                info!(master = %dead, "Master re-registered, skipping failover");
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(master = %dead, error = %e, "Could not confirm master removal"),
        }

        if let Err(e) = self.failover_master(dead).await {
            error!(master = %dead, error = %e, "Master failover failed");
        }
    }

    async fn take_over(&self, dead: &Host) -> Result<usize> {
        let instances = self.dao.find_unfinished_by_host(&dead.key()).await?;
        info!(
            dead_master = %dead,
            instances = instances.len(),
            "Starting master failover"
        );

        let mut recovered = 0;
        for mut instance in instances {
            if self.engine.repository().contains(instance.id) {
                continue;
            }

            for task in instance.task_instances.values_mut() {
                if !task.state.is_should_failover() {
                    continue;
                }
                // Stop a stale attempt that is still running somewhere
                if let Some(host) = task.host.take() {
                    if matches!(
                        task.state,
                        ExecutionStatus::Dispatch | ExecutionStatus::RunningExecution
                    ) && self.liveness.is_worker_alive(&host)
                    {
                        self.killer.kill(&host, task.id).await;
                    }
                }
                log_state_transition(
                    "task_instance",
                    task.id,
                    &task.state.to_string(),
                    &ExecutionStatus::NeedFaultTolerance.to_string(),
                    "master_failover",
                );
                task.state = ExecutionStatus::NeedFaultTolerance;
                task.end_time = Some(Utc::now());
            }

            let id = instance.id;
            match self.engine.recover(instance).await {
                Ok(_) => recovered += 1,
                Err(e) => error!(
                    workflow_instance_id = id,
                    error = %e,
                    "Failed to recover workflow instance"
                ),
            }
        }

        info!(
            dead_master = %dead,
            new_owner = %self.self_host,
            recovered = recovered,
            "Master failover finished"
        );
        Ok(recovered)
    }
}

#[async_trait]
impl NodeChangeListener for MasterFailoverCoordinator {
    async fn on_node_change(&self, change: &NodeChange) {
        let NodeChange::MasterRemoved(dead) = change else {
            return;
        };
        if dead == &self.self_host {
            return;
        }

        // The grace period and takeover run apart from the change queue
        let coordinator = self.clone();
        let dead = dead.clone();
        tokio::spawn(async move {
            coordinator.on_master_removed(&dead).await;
        });
    }

    fn listener_name(&self) -> &str {
        "master_failover"
    }
}
