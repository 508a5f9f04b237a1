//! Master node bootstrap

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::killer::RemoteTaskKiller;
use super::processors::{TaskExecuteResultProcessor, TaskExecuteRunningProcessor};
use crate::config::DagflowConfig;
use crate::dispatch::dispatcher::ExecutorDispatcher;
use crate::dispatch::host::Host;
use crate::dispatch::manager::RemoteExecutorManager;
use crate::engine::dao::InstanceDao;
use crate::engine::dispatch_loop::TaskDispatchLoop;
use crate::engine::failover::{MasterFailoverCoordinator, WorkerFailoverListener};
use crate::engine::repository::WorkflowRunnableRepository;
use crate::engine::runnable::RunnableContext;
use crate::engine::workflow_engine::WorkflowEngine;
use crate::error::{DagflowError, Result};
use crate::registry::client::RegistryClient;
use crate::registry::heartbeat::{
    HeartBeatProducer, NodeRole, ResourceProbe, ResourceThresholds, RoleSource,
};
use crate::registry::node_manager::ServerNodeManager;
use crate::registry::paths;
use crate::registry::store::Registry;
use crate::remote::client::RemotingClient;
use crate::remote::connection::ConnectionContext;
use crate::remote::processor::{PingProcessor, ProcessorRegistry};
use crate::remote::server::RemotingServer;
use crate::web::{spawn_web_server, AppState};

/// A running master node.
///
/// Startup: bind the RPC server, build the dispatch and execution engine,
/// register failover listeners, register in the registry, reclaim workflows
/// a previous process on this host left unfinished, then serve the HTTP views.
pub struct MasterServer {
    host: Host,
    web_address: SocketAddr,
    server: RemotingServer,
    client: Arc<RemotingClient>,
    registry_client: RegistryClient,
    engine: Arc<WorkflowEngine>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MasterServer {
    pub async fn start(
        config: DagflowConfig,
        registry: Arc<dyn Registry>,
        dao: Arc<dyn InstanceDao>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        let master = &config.master;
        let processors = Arc::new(ProcessorRegistry::new());
        let context = Arc::new(ConnectionContext::new(
            &config.remoting,
            Arc::clone(&processors),
        ));
        let client = Arc::new(RemotingClient::new(
            config.remoting.clone(),
            Arc::clone(&context),
        ));

        let server = RemotingServer::new(
            format!("{}:{}", master.listen_address, master.listen_port),
            Arc::clone(&context),
        );
        let bound = server.start().await?;
        let host = Host::new(master.listen_address.clone(), bound.port());

        let node_path = paths::master_path(&host);
        let node_manager = Arc::new(ServerNodeManager::new(
            Arc::clone(&registry),
            Some(node_path.clone()),
            master.host_warmup(),
        ));

        let dispatcher = Arc::new(ExecutorDispatcher::new(master.host_selector.build()));
        dispatcher.register(Arc::new(RemoteExecutorManager::new(
            Arc::clone(&client),
            Arc::clone(&node_manager),
            host.key(),
            config.dispatch.request_timeout(),
        )));
        let killer = Arc::new(RemoteTaskKiller::new(
            Arc::clone(&client),
            config.dispatch.request_timeout(),
        ));
        let dispatch_loop = Arc::new(
            TaskDispatchLoop::new(dispatcher, &config.dispatch).with_killer(killer.clone()),
        );

        let runnable_context = Arc::new(RunnableContext {
            dao: Arc::clone(&dao),
            dispatch_loop,
            killer: killer.clone(),
            liveness: node_manager.clone(),
            max_failover_times: config.dispatch.max_failover_times,
            event_queue_size: master.event_queue_size,
        });
        let repository = Arc::new(WorkflowRunnableRepository::new());
        let engine = Arc::new(WorkflowEngine::new(
            runnable_context,
            Arc::clone(&repository),
            host.key(),
        ));

        processors.register(Arc::new(PingProcessor));
        processors.register(Arc::new(TaskExecuteRunningProcessor::new(Arc::clone(
            &repository,
        ))));
        processors.register(Arc::new(TaskExecuteResultProcessor::new(Arc::clone(
            &repository,
        ))));

        let coordinator = Arc::new(MasterFailoverCoordinator::new(
            host.clone(),
            Arc::clone(&registry),
            dao,
            Arc::clone(&engine),
            killer,
            node_manager.clone(),
            master.failover_interval(),
            config.registry.session_timeout(),
        ));
        node_manager.add_listener(Arc::new(WorkerFailoverListener::new(Arc::clone(
            &repository,
        ))));
        node_manager.add_listener(coordinator.clone());

        let role: RoleSource = Arc::new(|| NodeRole::Master);
        let producer = HeartBeatProducer::new(
            host.key(),
            probe,
            ResourceThresholds {
                max_cpu_load_avg: master.max_cpu_load_avg,
                reserved_memory_gb: master.reserved_memory_gb,
            },
            role,
        );
        let registry_client = RegistryClient::new(
            registry,
            node_path,
            config.registry.session_timeout(),
            master.heartbeat_interval(),
            producer,
            Arc::clone(&node_manager),
        );
        registry_client.start().await?;

        // Workflows a previous process on this host did not finish
        match coordinator.failover_master(&host).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered = recovered, "Recovered own unfinished workflows"),
            Err(e) => warn!(error = %e, "Failed to recover own unfinished workflows"),
        }

        let listener = TcpListener::bind(&master.web_bind_address)
            .await
            .map_err(|e| DagflowError::WebBind {
                address: master.web_bind_address.clone(),
                reason: e.to_string(),
            })?;
        let web_address = listener.local_addr().map_err(|e| DagflowError::WebBind {
            address: master.web_bind_address.clone(),
            reason: e.to_string(),
        })?;

        let (shutdown_tx, _) = broadcast::channel(4);
        let tasks = vec![
            spawn_web_server(
                listener,
                AppState::new(repository, node_manager, host.key()),
                shutdown_tx.subscribe(),
            ),
            client.start_reaper(),
        ];

        info!(
            host = %host,
            web = %web_address,
            selector = %master.host_selector,
            "Master server started"
        );

        Ok(Self {
            host,
            web_address,
            server,
            client,
            registry_client,
            engine,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn web_address(&self) -> SocketAddr {
        self.web_address
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn node_manager(&self) -> &Arc<ServerNodeManager> {
        self.registry_client.node_manager()
    }

    pub fn registry_client(&self) -> &RegistryClient {
        &self.registry_client
    }

    /// Deregister, stop serving and close outbound connections.
    ///
    /// Running workflows are left unfinished in the DAO for another master
    /// (or the next process on this host) to recover.
    pub async fn shutdown(&self) {
        self.registry_client.shutdown().await;
        let _ = self.shutdown_tx.send(());
        self.server.stop();
        self.client.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(host = %self.host, "Master server stopped");
    }
}
