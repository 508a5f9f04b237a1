//! Outbound side of the transport
//!
//! [`RemotingClient`] keeps one long-lived connection per remote host and offers
//! fire-and-forget [`RemotingClient::send`] and correlated
//! [`RemotingClient::send_sync`]. Nothing here retries; callers decide.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::command::Command;
use super::connection::{spawn_connection, Channel, ConnectionContext, OnClose};
use super::errors::RemotingError;
use super::future::ResponseFutureTable;
use crate::config::RemotingConfig;
use crate::dispatch::host::Host;

pub struct RemotingClient {
    config: RemotingConfig,
    context: Arc<ConnectionContext>,
    /// Active connections keyed by `host:port`
    channels: Arc<DashMap<String, Channel>>,
    /// One dial at a time per host; entries go when their connection does
    dial_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RemotingClient {
    pub fn new(config: RemotingConfig, context: Arc<ConnectionContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config,
            context,
            channels: Arc::new(DashMap::new()),
            dial_locks: Arc::new(DashMap::new()),
            shutdown_tx,
        }
    }

    pub fn futures(&self) -> &Arc<ResponseFutureTable> {
        &self.context.futures
    }

    /// Start the background reaper for futures nobody awaits any more
    pub fn start_reaper(&self) -> JoinHandle<()> {
        Arc::clone(&self.context.futures).spawn_reaper(
            self.config.future_reaper_interval(),
            self.shutdown_tx.subscribe(),
        )
    }

    /// Write a command without waiting for any reply
    pub async fn send(&self, host: &Host, command: Command) -> Result<(), RemotingError> {
        let channel = self.channel(host).await?;
        debug!(host = %host, command = %command, "Sending command");
        channel.send(command).await
    }

    /// Write a command and wait for the reply carrying the same opaque id.
    ///
    /// The response future is registered against the connection it is written
    /// to, before the write. On timeout it is removed and
    /// [`RemotingError::Timeout`] is returned.
    pub async fn send_sync(
        &self,
        host: &Host,
        command: Command,
        timeout: Duration,
    ) -> Result<Command, RemotingError> {
        let key = host.key();
        let opaque = command.opaque();
        let futures = &self.context.futures;
        let channel = self.channel(host).await?;
        let mut latch = futures.register(opaque, key.clone(), channel.connection_id(), timeout)?;

        if let Err(e) = channel.send(command).await {
            futures.remove(opaque);
            return Err(e);
        }

        match tokio::time::timeout(timeout, &mut latch).await {
            Ok(Ok(result)) => result,
            // Table dropped the sender without resolving it
            Ok(Err(_)) => Err(RemotingError::ConnectionClosed { host: key }),
            Err(_) => {
                if futures.remove(opaque) {
                    return Err(RemotingError::Timeout {
                        host: key,
                        opaque,
                        timeout,
                    });
                }
                // Lost the race to a reply or the reaper; take whatever it left.
                latch.try_recv().unwrap_or(Err(RemotingError::Timeout {
                    host: key,
                    opaque,
                    timeout,
                }))
            }
        }
    }

    pub fn is_connected(&self, host: &Host) -> bool {
        self.channels
            .get(&host.key())
            .map(|channel| channel.is_active())
            .unwrap_or(false)
    }

    /// Drop the cached connection to `host`, if any
    pub fn disconnect(&self, host: &Host) {
        let key = host.key();
        if let Some((_, channel)) = self.channels.remove(&key) {
            channel.close();
        }
        prune_dial_lock(&self.dial_locks, &key);
    }

    /// Hosts with a dial lock, connected or being dialed
    pub fn dial_lock_count(&self) -> usize {
        self.dial_locks.len()
    }

    /// Close every connection and stop the reaper
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let keys: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, channel)) = self.channels.remove(&key) {
                channel.close();
            }
        }
        info!("Remoting client closed");
    }

    async fn channel(&self, host: &Host) -> Result<Channel, RemotingError> {
        if !host.is_usable() {
            return Err(RemotingError::ConnectFailed {
                host: host.key(),
                reason: "host has no usable address".to_string(),
            });
        }

        let key = host.key();
        if let Some(channel) = self.active_channel(&key) {
            return Ok(channel);
        }

        let lock = self
            .dial_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let dialed = {
            let _guard = lock.lock().await;
            // Another caller may have finished dialing while we waited
            match self.active_channel(&key) {
                Some(channel) => Ok(channel),
                None => self.dial(host, &key).await,
            }
        };
        drop(lock);
        if dialed.is_err() {
            prune_dial_lock(&self.dial_locks, &key);
        }
        dialed
    }

    async fn dial(&self, host: &Host, key: &str) -> Result<Channel, RemotingError> {
        let key = key.to_string();
        let stream = tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect((host.address.as_str(), host.port)),
        )
        .await
        .map_err(|_| RemotingError::ConnectFailed {
            host: key.clone(),
            reason: format!("timed out after {:?}", self.config.connect_timeout()),
        })?
        .map_err(|e| RemotingError::ConnectFailed {
            host: key.clone(),
            reason: e.to_string(),
        })?;

        let channels = Arc::clone(&self.channels);
        let dial_locks = Arc::clone(&self.dial_locks);
        let evict_key = key.clone();
        let on_close: OnClose = Box::new(move |closed: &Channel| {
            let removed = channels.remove_if(&evict_key, |_, cached| {
                cached.connection_id() == closed.connection_id()
            });
            if removed.is_some() {
                warn!(host = %evict_key, "Connection closed, evicted from cache");
                prune_dial_lock(&dial_locks, &evict_key);
            }
        });

        let channel = spawn_connection(stream, key.clone(), Arc::clone(&self.context), Some(on_close))?;
        info!(host = %key, connection_id = %channel.connection_id(), "Connected");
        self.channels.insert(key, channel.clone());
        Ok(channel)
    }

    fn active_channel(&self, key: &str) -> Option<Channel> {
        self.channels
            .get(key)
            .filter(|channel| channel.is_active())
            .map(|channel| channel.clone())
    }
}

/// Forget the dial lock for `key` unless a caller is holding or awaiting it
fn prune_dial_lock(dial_locks: &DashMap<String, Arc<Mutex<()>>>, key: &str) {
    dial_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

impl Drop for RemotingClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        for entry in self.channels.iter() {
            entry.value().close();
        }
    }
}
