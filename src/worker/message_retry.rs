//! Delivery of task reports to the master
//!
//! Running and result reports must reach the master even across master
//! restarts and network blips. Each report is kept until the master
//! acknowledges it; [`MessageRetryRunner::spawn`] resends whatever is still
//! unacknowledged on a fixed interval. A result report replaces the running
//! report of the same task.
//!
//! A report is given up once its master has left the registry (the master
//! that takes over its workflows re-dispatches the task) or after
//! `max_retries` failed resends.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::host::Host;
use crate::registry::node_manager::ServerNodeManager;
use crate::remote::client::RemotingClient;
use crate::remote::command::{CommandBody, CommandType};
use crate::remote::errors::RemotingError;
use crate::remote::messages::{
    TaskExecuteResult, TaskExecuteResultAck, TaskExecuteRunning, TaskExecuteRunningAck,
};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskReport {
    Running(TaskExecuteRunning),
    Result(TaskExecuteResult),
}

impl TaskReport {
    pub fn task_instance_id(&self) -> i64 {
        match self {
            TaskReport::Running(report) => report.task_instance_id,
            TaskReport::Result(report) => report.task_instance_id,
        }
    }

    pub fn command_type(&self) -> CommandType {
        match self {
            TaskReport::Running(_) => CommandType::TaskExecuteRunning,
            TaskReport::Result(_) => CommandType::TaskExecuteResult,
        }
    }
}

/// Current view of which masters are registered
pub trait MasterLiveness: Send + Sync {
    fn is_master_alive(&self, host: &Host) -> bool;
}

impl MasterLiveness for ServerNodeManager {
    fn is_master_alive(&self, host: &Host) -> bool {
        ServerNodeManager::is_master_alive(self, host)
    }
}

#[derive(Debug, Clone)]
struct PendingReport {
    master: Host,
    report: TaskReport,
    /// Failed resends so far
    attempts: u32,
}

pub struct MessageRetryRunner {
    client: Arc<RemotingClient>,
    /// Unacknowledged reports keyed by (task instance, report type)
    pending: DashMap<(i64, CommandType), PendingReport>,
    masters: Option<Arc<dyn MasterLiveness>>,
    retry_interval: Duration,
    report_timeout: Duration,
    /// Zero keeps resending for as long as the master is registered
    max_retries: u32,
}

impl MessageRetryRunner {
    pub fn new(client: Arc<RemotingClient>, retry_interval: Duration, report_timeout: Duration) -> Self {
        Self {
            client,
            pending: DashMap::new(),
            masters: None,
            retry_interval,
            report_timeout,
            max_retries: 0,
        }
    }

    /// Give up reports whose master is no longer registered
    pub fn with_master_liveness(mut self, masters: Arc<dyn MasterLiveness>) -> Self {
        self.masters = Some(masters);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Send a report now and keep it for resending until acknowledged
    pub async fn send(&self, master: &Host, report: TaskReport) {
        let task_instance_id = report.task_instance_id();
        if matches!(report, TaskReport::Result(_)) {
            self.pending
                .remove(&(task_instance_id, CommandType::TaskExecuteRunning));
        }
        let key = (task_instance_id, report.command_type());
        self.pending.insert(
            key,
            PendingReport {
                master: master.clone(),
                report: report.clone(),
                attempts: 0,
            },
        );

        match self.deliver(master, &report).await {
            Ok(()) => {
                self.pending.remove(&key);
            }
            Err(e) => warn!(
                task_instance_id = task_instance_id,
                master = %master,
                report = %report.command_type(),
                error = %e,
                "Report not acknowledged, will retry"
            ),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, task_instance_id: i64) -> bool {
        self.pending
            .iter()
            .any(|entry| entry.key().0 == task_instance_id)
    }

    /// Resend every pending report once; returns how many were acknowledged.
    ///
    /// Reports that fail again are dropped when their master has left the
    /// registry or their retry budget is spent.
    pub async fn retry_pending(&self) -> usize {
        let snapshot: Vec<((i64, CommandType), PendingReport)> = self
            .pending
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (key, pending) in snapshot {
            match self.deliver(&pending.master, &pending.report).await {
                Ok(()) => {
                    // Only drop the entry we sent; a newer report may have replaced it
                    if self
                        .pending
                        .remove_if(&key, |_, current| current.report == pending.report)
                        .is_some()
                    {
                        delivered += 1;
                    }
                }
                Err(e) => {
                    debug!(
                        task_instance_id = key.0,
                        master = %pending.master,
                        error = %e,
                        "Report retry failed"
                    );
                    self.record_failure(key, &pending);
                }
            }
        }
        delivered
    }

    fn record_failure(&self, key: (i64, CommandType), pending: &PendingReport) {
        let attempts = pending.attempts.saturating_add(1);
        let master_gone = self
            .masters
            .as_ref()
            .is_some_and(|masters| !masters.is_master_alive(&pending.master));
        let exhausted = self.max_retries > 0 && attempts >= self.max_retries;

        if master_gone || exhausted {
            let dropped = self
                .pending
                .remove_if(&key, |_, current| current.report == pending.report);
            if dropped.is_some() {
                warn!(
                    task_instance_id = key.0,
                    master = %pending.master,
                    report = %key.1,
                    attempts = attempts,
                    master_gone = master_gone,
                    "Giving up on task report"
                );
            }
        } else if let Some(mut current) = self.pending.get_mut(&key) {
            if current.report == pending.report {
                current.attempts = attempts;
            }
        }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.retry_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.pending.is_empty() {
                            continue;
                        }
                        let delivered = self.retry_pending().await;
                        if delivered > 0 {
                            info!(
                                delivered = delivered,
                                remaining = self.pending.len(),
                                "Resent unacknowledged task reports"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Message retry runner stopped");
        })
    }

    async fn deliver(&self, master: &Host, report: &TaskReport) -> Result<(), RemotingError> {
        match report {
            TaskReport::Running(body) => {
                let reply = self
                    .client
                    .send_sync(master, body.to_command()?, self.report_timeout)
                    .await?;
                reply.body_as::<TaskExecuteRunningAck>()?;
            }
            TaskReport::Result(body) => {
                let reply = self
                    .client
                    .send_sync(master, body.to_command()?, self.report_timeout)
                    .await?;
                reply.body_as::<TaskExecuteResultAck>()?;
            }
        }
        Ok(())
    }
}
