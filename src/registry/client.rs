//! Node registration and heartbeat refresh

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::errors::{RegistryError, RegistryResult};
use super::heartbeat::HeartBeatProducer;
use super::node_manager::ServerNodeManager;
use super::paths;
use super::store::{LeaseId, Registry};
use crate::logging::log_registry_operation;

/// Registers this node under an ephemeral key and keeps it alive.
///
/// Startup order: ensure namespaces, grant a lease and publish the first
/// heartbeat, start the refresh timer, then start watching peers.
pub struct RegistryClient {
    registry: Arc<dyn Registry>,
    node_path: String,
    session_timeout: Duration,
    heartbeat_interval: Duration,
    producer: HeartBeatProducer,
    node_manager: Arc<ServerNodeManager>,
    lease: Arc<Mutex<Option<LeaseId>>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryClient {
    pub fn new(
        registry: Arc<dyn Registry>,
        node_path: String,
        session_timeout: Duration,
        heartbeat_interval: Duration,
        producer: HeartBeatProducer,
        node_manager: Arc<ServerNodeManager>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            registry,
            node_path,
            session_timeout,
            heartbeat_interval,
            producer,
            node_manager,
            lease: Arc::new(Mutex::new(None)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn node_path(&self) -> &str {
        &self.node_path
    }

    pub fn node_manager(&self) -> &Arc<ServerNodeManager> {
        &self.node_manager
    }

    /// Lease backing this node's registration
    pub fn lease(&self) -> RegistryResult<LeaseId> {
        (*self.lease.lock()).ok_or(RegistryError::NotStarted)
    }

    pub async fn start(&self) -> RegistryResult<()> {
        for namespace in paths::REQUIRED_NAMESPACES {
            if !self.registry.exists(namespace).await? {
                self.registry.put(namespace, String::new(), None).await?;
                debug!(namespace = namespace, "Created registry namespace");
            }
        }

        let lease = register(
            self.registry.as_ref(),
            &self.node_path,
            self.session_timeout,
            &self.producer,
        )
        .await?;
        *self.lease.lock() = Some(lease);
        log_registry_operation("register", &self.node_path, "success", None);

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.registry),
            self.node_path.clone(),
            self.session_timeout,
            self.heartbeat_interval,
            self.producer.clone(),
            Arc::clone(&self.lease),
            self.shutdown_tx.subscribe(),
        ));

        let watch = Arc::clone(&self.node_manager)
            .start(self.shutdown_tx.subscribe())
            .await?;

        self.tasks.lock().extend([heartbeat, watch]);
        Ok(())
    }

    /// Stop refreshing and remove the registration, best effort
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let lease = self.lease.lock().take();
        if let Some(lease) = lease {
            match self.registry.revoke_lease(lease).await {
                Ok(()) => log_registry_operation("deregister", &self.node_path, "success", None),
                Err(e) => warn!(path = %self.node_path, error = %e, "Failed to deregister"),
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn register(
    registry: &dyn Registry,
    node_path: &str,
    session_timeout: Duration,
    producer: &HeartBeatProducer,
) -> RegistryResult<LeaseId> {
    let lease = registry.grant_lease(session_timeout).await?;
    let heartbeat = producer.produce().encode()?;
    registry.put(node_path, heartbeat, Some(lease)).await?;
    Ok(lease)
}

async fn heartbeat_loop(
    registry: Arc<dyn Registry>,
    node_path: String,
    session_timeout: Duration,
    interval: Duration,
    producer: HeartBeatProducer,
    lease: Arc<Mutex<Option<LeaseId>>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.recv() => break,
        }

        let Some(current) = *lease.lock() else { break };
        let refreshed = async {
            registry.keep_alive(current).await?;
            let heartbeat = producer.produce().encode()?;
            registry.put(&node_path, heartbeat, Some(current)).await
        }
        .await;

        match refreshed {
            Ok(()) => debug!(path = %node_path, "Heartbeat refreshed"),
            Err(RegistryError::LeaseNotFound(_)) => {
                // Session expired under us; come back with a new one
                warn!(path = %node_path, "Registry session lost, re-registering");
                match register(registry.as_ref(), &node_path, session_timeout, &producer).await {
                    Ok(new_lease) => {
                        *lease.lock() = Some(new_lease);
                        info!(path = %node_path, lease = new_lease, "Re-registered");
                    }
                    Err(e) => error!(path = %node_path, error = %e, "Re-registration failed"),
                }
            }
            Err(e) => warn!(path = %node_path, error = %e, "Heartbeat refresh failed"),
        }
    }
    debug!(path = %node_path, "Heartbeat loop stopped");
}
