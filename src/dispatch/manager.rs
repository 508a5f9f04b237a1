//! Executor managers: how a context actually reaches an executor

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::context::{ExecutionContext, ExecutorType};
use super::errors::DispatchError;
use super::host::Host;
use crate::registry::node_manager::ServerNodeManager;
use crate::remote::client::RemotingClient;
use crate::remote::command::CommandBody;
use crate::remote::messages::{TaskDispatchRequest, TaskDispatchResponse};

/// Delivers execution contexts of one executor type.
///
/// The dispatcher calls `before_execute`, then `execute`, then always
/// `after_execute`.
#[async_trait]
pub trait ExecutorManager: Send + Sync {
    fn executor_type(&self) -> ExecutorType;

    /// Live hosts able to run `context`, in a stable order
    fn candidate_hosts(&self, context: &ExecutionContext) -> Vec<Host>;

    async fn before_execute(&self, _context: &ExecutionContext) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Send the context to `context.host`
    async fn execute(&self, context: &ExecutionContext) -> Result<(), DispatchError>;

    async fn after_execute(&self, _context: &ExecutionContext) {}
}

/// Dispatches to workers over the RPC transport
pub struct RemoteExecutorManager {
    client: Arc<RemotingClient>,
    nodes: Arc<ServerNodeManager>,
    /// Where workers report progress (`host:port` of this master)
    master_address: String,
    request_timeout: Duration,
    /// Dispatch requests currently on the wire, by task instance
    in_flight: DashMap<i64, Host>,
}

impl RemoteExecutorManager {
    pub fn new(
        client: Arc<RemotingClient>,
        nodes: Arc<ServerNodeManager>,
        master_address: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            nodes,
            master_address: master_address.into(),
            request_timeout,
            in_flight: DashMap::new(),
        }
    }

    pub fn in_flight(&self) -> Vec<(i64, Host)> {
        self.in_flight
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl ExecutorManager for RemoteExecutorManager {
    fn executor_type(&self) -> ExecutorType {
        ExecutorType::Worker
    }

    fn candidate_hosts(&self, context: &ExecutionContext) -> Vec<Host> {
        self.nodes.worker_hosts(context.worker_group())
    }

    async fn before_execute(&self, context: &ExecutionContext) -> Result<(), DispatchError> {
        if let Some(host) = &context.host {
            self.in_flight.insert(context.task_instance_id(), host.clone());
        }
        Ok(())
    }

    async fn execute(&self, context: &ExecutionContext) -> Result<(), DispatchError> {
        let host = context.host.as_ref().ok_or_else(|| DispatchError::UnusableHost {
            host: String::new(),
        })?;

        let request = TaskDispatchRequest {
            master_address: self.master_address.clone(),
            context: context.task.clone(),
        };
        let command = request.to_command()?;

        let reply = self
            .client
            .send_sync(host, command, self.request_timeout)
            .await
            .map_err(|source| DispatchError::Remoting {
                host: host.key(),
                source,
            })?;
        let response: TaskDispatchResponse = reply.body_as()?;

        if response.accepted {
            debug!(
                task_instance_id = context.task_instance_id(),
                host = %host,
                "Dispatch accepted"
            );
            Ok(())
        } else {
            Err(DispatchError::Rejected {
                host: host.key(),
                task_instance_id: context.task_instance_id(),
                reason: response.reason.unwrap_or_else(|| "unspecified".to_string()),
            })
        }
    }

    async fn after_execute(&self, context: &ExecutionContext) {
        self.in_flight.remove(&context.task_instance_id());
    }
}
