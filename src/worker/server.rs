//! Worker node bootstrap

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::executor::WorkerTaskExecutor;
use super::message_retry::MessageRetryRunner;
use super::plugin::TaskPluginRegistry;
use super::processors::{TaskDispatchProcessor, TaskKillProcessor};
use crate::config::DagflowConfig;
use crate::dispatch::host::Host;
use crate::error::Result;
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

/// A running worker node.
///
/// Startup: bind the RPC server, wire the executor into the processor table,
/// register in the registry, then start the report retry loop.
pub struct WorkerServer {
    host: Host,
    server: RemotingServer,
    client: Arc<RemotingClient>,
    registry_client: RegistryClient,
    executor: Arc<WorkerTaskExecutor>,
    reports: Arc<MessageRetryRunner>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerServer {
    pub async fn start(
        config: DagflowConfig,
        registry: Arc<dyn Registry>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self> {
        let worker = &config.worker;
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
            format!("{}:{}", worker.listen_address, worker.listen_port),
            Arc::clone(&context),
        );
        let bound = server.start().await?;
        let host = Host::new(worker.listen_address.clone(), bound.port());

        let running_count = Arc::new(AtomicUsize::new(0));
        let role: RoleSource = {
            let running = Arc::clone(&running_count);
            let group = worker.group.clone();
            let host_weight = worker.host_weight;
            let exec_threads = worker.exec_threads;
            Arc::new(move || NodeRole::Worker {
                worker_group: group.clone(),
                host_weight,
                worker_exec_threads: exec_threads,
                running_task_count: running.load(Ordering::SeqCst),
            })
        };
        let producer = HeartBeatProducer::new(
            host.key(),
            probe,
            ResourceThresholds {
                max_cpu_load_avg: worker.max_cpu_load_avg,
                reserved_memory_gb: worker.reserved_memory_gb,
            },
            role,
        );


        let node_path = paths::worker_path(&worker.group, &host);
        let node_manager = Arc::new(ServerNodeManager::new(
            Arc::clone(&registry),
            Some(node_path.clone()),
            config.master.host_warmup(),
        ));
        let reports = Arc::new(
            MessageRetryRunner::new(
                Arc::clone(&client),
                worker.ack_retry_interval(),
                worker.report_timeout(),
            )
            .with_master_liveness(node_manager.clone())
            .with_max_retries(worker.report_max_retries),
        );
        let executor = Arc::new(WorkerTaskExecutor::new(
            host.clone(),
            Arc::new(TaskPluginRegistry::with_defaults()),
            Arc::clone(&reports),
            producer.clone(),
            worker.exec_threads,
            running_count,
        ));

        processors.register(Arc::new(PingProcessor));
        processors.register(Arc::new(TaskDispatchProcessor::new(Arc::clone(&executor))));
        processors.register(Arc::new(TaskKillProcessor::new(Arc::clone(&executor))));


        let registry_client = RegistryClient::new(
            registry,
            node_path,
            config.registry.session_timeout(),
            worker.heartbeat_interval(),
            producer,
            node_manager,
        );
        registry_client.start().await?;

        let (shutdown_tx, _) = broadcast::channel(4);
        let tasks = vec![
            Arc::clone(&reports).spawn(shutdown_tx.subscribe()),
            client.start_reaper(),
        ];

        info!(
            host = %host,
            group = %worker.group,
            exec_threads = worker.exec_threads,
            "Worker server started"
        );

        Ok(Self {
            host,
            server,
            client,
            registry_client,
            executor,
            reports,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn executor(&self) -> &Arc<WorkerTaskExecutor> {
        &self.executor
    }

    pub fn reports(&self) -> &Arc<MessageRetryRunner> {
        &self.reports
    }

    pub fn registry_client(&self) -> &RegistryClient {
        &self.registry_client
    }

    /// Deregister, stop serving and close outbound connections
    pub async fn shutdown(&self) {
        self.registry_client.shutdown().await;
        let _ = self.shutdown_tx.send(());
        self.server.stop();
        self.client.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(host = %self.host, "Worker server stopped");
    }
}
