//! Inbound command dispatch
//!
//! The receive loop of every connection looks up a [`CommandProcessor`] by
//! command type in the [`ProcessorRegistry`] and hands the call to the
//! [`HandlerPool`], so socket reads never wait on business logic.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::command::{Command, CommandType};
use super::errors::ProtocolError;

/// Identity of the remote end of a connection
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub connection_id: String,
    pub address: SocketAddr,
}

/// Handler for one command type.
///
/// A returned command is written back on the same connection; returning
/// `Ok(None)` sends nothing.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    fn command_type(&self) -> CommandType;

    async fn process(
        &self,
        command: Command,
        peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError>;

    /// Handler name for logging
    fn processor_name(&self) -> &str;
}

/// Command type → processor table
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<CommandType, Arc<dyn CommandProcessor>>>,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under its command type, replacing any previous one
    pub fn register(&self, processor: Arc<dyn CommandProcessor>) {
        let command_type = processor.command_type();
        let mut processors = self.processors.write();
        if processors.contains_key(&command_type) {
            warn!(
                command_type = %command_type,
                "Replacing existing processor"
            );
        }
        info!(
            command_type = %command_type,
            processor = processor.processor_name(),
            "Registered command processor"
        );
        processors.insert(command_type, processor);
    }

    pub fn unregister(&self, command_type: CommandType) -> bool {
        self.processors.write().remove(&command_type).is_some()
    }

    pub fn get(&self, command_type: CommandType) -> Option<Arc<dyn CommandProcessor>> {
        self.processors.read().get(&command_type).cloned()
    }

    pub fn has_processor(&self, command_type: CommandType) -> bool {
        self.processors.read().contains_key(&command_type)
    }

    pub fn registered_types(&self) -> Vec<CommandType> {
        self.processors.read().keys().copied().collect()
    }

    /// Route a command to its processor and return the optional reply
    pub async fn route(
        &self,
        command: Command,
        peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        let processor =
            self.get(command.command_type())
                .ok_or(ProcessorError::ProcessorNotFound {
                    command_type: command.command_type(),
                })?;

        let command_type = command.command_type();
        let opaque = command.opaque();
        let start = std::time::Instant::now();

        match processor.process(command, peer).await {
            Ok(reply) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    command_type = %command_type,
                    opaque = opaque,
                    peer = %peer.address,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Command processed"
                );
                Ok(reply)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    command_type = %command_type,
                    opaque = opaque,
                    peer = %peer.address,
                    error = %e,
                    "Command processing failed"
                );
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> ProcessorRegistryStats {
        ProcessorRegistryStats {
            registered_processors: self.processors.read().len(),
            commands_processed: self.processed.load(Ordering::Relaxed),
            commands_failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorRegistryStats {
    pub registered_processors: usize,
    pub commands_processed: u64,
    pub commands_failed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("No processor registered for command type: {command_type}")]
    ProcessorNotFound { command_type: CommandType },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Processing failed: {reason}")]
    Failed { reason: String },
}

impl ProcessorError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Answers `Ping` with a `Pong` echoing the body
pub struct PingProcessor;

#[async_trait]
impl CommandProcessor for PingProcessor {
    fn command_type(&self) -> CommandType {
        CommandType::Ping
    }

    async fn process(
        &self,
        command: Command,
        _peer: &PeerInfo,
    ) -> Result<Option<Command>, ProcessorError> {
        Ok(Some(command.reply(CommandType::Pong, command.body().clone())))
    }

    fn processor_name(&self) -> &str {
        "ping"
    }
}

/// Bounded pool for handler work.
///
/// At most `size` handlers run at once; further work waits for a permit
/// without holding up the connection that received it.
#[derive(Debug, Clone)]
pub struct HandlerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl HandlerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn submit<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn peer() -> PeerInfo {
        PeerInfo {
            connection_id: "test".to_string(),
            address: "127.0.0.1:9".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_route_to_registered_processor() {
        let registry = ProcessorRegistry::new();
        registry.register(Arc::new(PingProcessor));
        assert!(registry.has_processor(CommandType::Ping));

        let command = Command::new(CommandType::Ping, Bytes::from_static(b"hi"));
        let reply = registry.route(command.clone(), &peer()).await.unwrap().unwrap();

        assert_eq!(reply.command_type(), CommandType::Pong);
        assert_eq!(reply.opaque(), command.opaque());
        assert_eq!(registry.stats().commands_processed, 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_reported() {
        let registry = ProcessorRegistry::new();
        let command = Command::new(CommandType::TaskKillRequest, Bytes::new());

        let result = registry.route(command, &peer()).await;
        assert!(matches!(
            result,
            Err(ProcessorError::ProcessorNotFound {
                command_type: CommandType::TaskKillRequest
            })
        ));
    }

    #[tokio::test]
    async fn test_handler_pool_bounds_concurrency() {
        let pool = HandlerPool::new(2);
        let running = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(8);

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(()).await;
            });
        }

        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
