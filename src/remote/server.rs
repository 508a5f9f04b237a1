//! Inbound side of the transport

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::connection::{spawn_connection, Channel, ConnectionContext, OnClose};
use super::errors::RemotingError;
use dashmap::DashMap;

/// Accepts peer connections and serves them with the node's processor table.
///
/// ```rust,no_run
/// use dagflow_core::config::RemotingConfig;
/// use dagflow_core::remote::{ConnectionContext, ProcessorRegistry, RemotingServer};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RemotingConfig::default();
/// let context = Arc::new(ConnectionContext::new(&config, Arc::new(ProcessorRegistry::new())));
/// let server = RemotingServer::new("127.0.0.1:0", context);
/// let bound = server.start().await?;
/// println!("listening on {bound}");
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct RemotingServer {
    bind_address: String,
    context: Arc<ConnectionContext>,
    connections: Arc<DashMap<String, Channel>>,
    total_connections: Arc<AtomicU64>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RemotingServer {
    pub fn new(bind_address: impl Into<String>, context: Arc<ConnectionContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            bind_address: bind_address.into(),
            context,
            connections: Arc::new(DashMap::new()),
            total_connections: Arc::new(AtomicU64::new(0)),
            local_addr: Mutex::new(None),
            shutdown_tx,
        }
    }

    /// Bind and start accepting. Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, RemotingError> {
        if self.is_running() {
            return Err(RemotingError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_address).await.map_err(|e| {
            RemotingError::BindFailed {
                address: self.bind_address.clone(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;

        {
            let mut guard = self.local_addr.lock();
            if guard.is_some() {
                return Err(RemotingError::AlreadyRunning);
            }
            *guard = Some(local_addr);
        }

        info!(address = %local_addr, "Remoting server listening");

        let context = Arc::clone(&self.context);
        let connections = Arc::clone(&self.connections);
        let total = Arc::clone(&self.total_connections);
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(accept_connections(
            listener,
            context,
            connections,
            total,
            shutdown_rx,
        ));

        Ok(local_addr)
    }

    /// Stop accepting and close every open connection
    pub fn stop(&self) {
        if self.local_addr.lock().take().is_none() {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
        info!(address = %self.bind_address, "Remoting server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }
}

impl Drop for RemotingServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_connections(
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    connections: Arc<DashMap<String, Channel>>,
    total: Arc<AtomicU64>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        total.fetch_add(1, Ordering::Relaxed);
                        let registry = Arc::clone(&connections);
                        let on_close: OnClose = Box::new(move |channel: &Channel| {
                            registry.remove(channel.connection_id());
                            debug!(connection_id = %channel.connection_id(), "Inbound connection closed");
                        });
                        match spawn_connection(stream, peer.to_string(), Arc::clone(&context), Some(on_close)) {
                            Ok(channel) => {
                                debug!(peer = %peer, connection_id = %channel.connection_id(), "Accepted connection");
                                connections.insert(channel.connection_id().to_string(), channel);
                            }
                            Err(e) => error!(peer = %peer, error = %e, "Failed to set up connection"),
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}
