//! Caller-side retry around [`ExecutorDispatcher`]
//!
//! A dispatch that timed out or lost its connection may still have been
//! accepted. It is retried on the same host, where a repeated attempt is a
//! no-op. Only when that host can no longer take it is the attempt revoked
//! there and the host left out of later selections, so one generation never
//! runs on two hosts.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::event::WorkflowEvent;
use super::runnable::TaskKiller;
use crate::config::DispatchConfig;
use crate::dispatch::context::ExecutionContext;
use crate::dispatch::dispatcher::ExecutorDispatcher;
use crate::dispatch::errors::DispatchError;
use crate::dispatch::host::Host;

/// Re-runs `dispatch` against a fresh selection, a bounded number of times
/// with a fixed delay, and reports the outcome to the owning runnable.
pub struct TaskDispatchLoop {
    dispatcher: Arc<ExecutorDispatcher>,
    killer: Option<Arc<dyn TaskKiller>>,
    max_retries: u32,
    interval: Duration,
}

impl TaskDispatchLoop {
    pub fn new(dispatcher: Arc<ExecutorDispatcher>, config: &DispatchConfig) -> Self {
        Self {
            dispatcher,
            killer: None,
            max_retries: config.max_task_commit_retries,
            interval: config.task_commit_interval(),
        }
    }

    /// Revoke attempts with an unknown outcome through `killer`
    pub fn with_killer(mut self, killer: Arc<dyn TaskKiller>) -> Self {
        self.killer = Some(killer);
        self
    }

    pub fn dispatcher(&self) -> &Arc<ExecutorDispatcher> {
        &self.dispatcher
    }

    /// Up to `1 + max_retries` attempts; configuration errors end it early
    pub async fn dispatch_with_retry(
        &self,
        mut context: ExecutionContext,
    ) -> Result<Host, DispatchError> {
        let mut attempt = 0;
        // Host that may have accepted the attempt without telling us
        let mut uncertain: Option<Host> = None;
        loop {
            context.host = uncertain.clone();
            let result = self.dispatcher.dispatch(&mut context).await;
            let error = match result {
                Ok(host) => return Ok(host),
                Err(e) => e,
            };

            if error.is_outcome_unknown() {
                if uncertain.is_none() {
                    uncertain = context.host.clone();
                }
            } else if let Some(host) = uncertain.take() {
                self.revoke(&context, &host, &error).await;
                context.excluded_hosts.push(host);
            }

            if !error.is_retryable() || attempt >= self.max_retries {
                if let Some(host) = uncertain.take() {
                    self.revoke(&context, &host, &error).await;
                }
                return Err(error);
            }
            attempt += 1;
            debug!(
                task_instance_id = context.task_instance_id(),
                attempt = attempt,
                max_retries = self.max_retries,
                pinned = ?uncertain,
                error = %error,
                "Retrying dispatch"
            );
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn revoke(&self, context: &ExecutionContext, host: &Host, error: &DispatchError) {
        let Some(killer) = &self.killer else {
            return;
        };
        warn!(
            task_instance_id = context.task_instance_id(),
            generation = context.task.generation,
            host = %host,
            error = %error,
            "Leaving a host that may hold the attempt, revoking it there"
        );
        killer
            .revoke(host, context.task_instance_id(), context.task.generation)
            .await;
    }

    /// Dispatch in the background and post the outcome to `events`
    pub fn spawn(self: &Arc<Self>, context: ExecutionContext, events: mpsc::Sender<WorkflowEvent>) {
        let dispatch_loop = Arc::clone(self);
        tokio::spawn(async move {
            let task_instance_id = context.task_instance_id();
            let generation = context.task.generation;
            let event = match dispatch_loop.dispatch_with_retry(context).await {
                Ok(host) => WorkflowEvent::TaskDispatched {
                    task_instance_id,
                    generation,
                    host,
                },
                Err(e) => {
                    warn!(
                        task_instance_id = task_instance_id,
                        error = %e,
                        "Dispatch failed after retries"
                    );
                    WorkflowEvent::DispatchFailed {
                        task_instance_id,
                        generation,
                        reason: e.to_string(),
                    }
                }
            };
            if events.send(event).await.is_err() {
                debug!(
                    task_instance_id = task_instance_id,
                    "Workflow runnable gone before dispatch outcome arrived"
                );
            }
        });
    }
}
