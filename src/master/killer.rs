use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::dispatch::host::Host;
use crate::engine::runnable::TaskKiller;
use crate::remote::client::RemotingClient;
use crate::remote::command::CommandBody;
use crate::remote::messages::{TaskKillRequest, TaskKillResponse};

/// Sends kill requests to workers over the RPC transport
pub struct RemoteTaskKiller {
    client: Arc<RemotingClient>,
    timeout: Duration,
}

impl RemoteTaskKiller {
    pub fn new(client: Arc<RemotingClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn send(&self, host: &Host, request: TaskKillRequest) {
        let task_instance_id = request.task_instance_id;
        let generation = request.generation;
        let command = match request.to_command() {
            Ok(command) => command,
            Err(e) => {
                warn!(task_instance_id = task_instance_id, error = %e, "Could not encode kill request");
                return;
            }
        };

        let response = match self.client.send_sync(host, command, self.timeout).await {
            Ok(reply) => reply.body_as::<TaskKillResponse>(),
            Err(e) => {
                warn!(
                    task_instance_id = task_instance_id,
                    generation = ?generation,
                    host = %host,
                    error = %e,
                    "Kill request failed"
                );
                return;
            }
        };

        match response {
            Ok(response) => info!(
                task_instance_id = task_instance_id,
                generation = ?generation,
                host = %host,
                killed = response.killed,
                process_id = ?response.process_id,
                "Kill request answered"
            ),
            Err(e) => warn!(
                task_instance_id = task_instance_id,
                host = %host,
                error = %e,
                "Malformed kill response"
            ),
        }
    }
}

#[async_trait]
impl TaskKiller for RemoteTaskKiller {
    async fn kill(&self, host: &Host, task_instance_id: i64) {
        self.send(
            host,
            TaskKillRequest {
                task_instance_id,
                generation: None,
            },
        )
        .await;
    }

    async fn revoke(&self, host: &Host, task_instance_id: i64, generation: u32) {
        self.send(
            host,
            TaskKillRequest {
                task_instance_id,
                generation: Some(generation),
            },
        )
        .await;
    }
}
