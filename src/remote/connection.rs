//! Per-connection I/O tasks shared by the client and the server
//!
//! Each TCP connection gets a reader task and a writer task. The reader decodes
//! frames, completes pending futures for reply commands and hands request
//! commands to the handler pool. The writer drains a bounded queue so callers
//! never write to the socket themselves.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::codec::{CommandDecoder, CommandEncoder};
use super::command::Command;
use super::errors::RemotingError;
use super::future::ResponseFutureTable;
use super::processor::{HandlerPool, PeerInfo, ProcessorError, ProcessorRegistry};
use crate::config::RemotingConfig;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Shared collaborators for every connection of a node
pub struct ConnectionContext {
    pub processors: Arc<ProcessorRegistry>,
    pub futures: Arc<ResponseFutureTable>,
    pub handler_pool: HandlerPool,
    pub max_frame_length: usize,
    pub write_queue_size: usize,
}

impl ConnectionContext {
    pub fn new(config: &RemotingConfig, processors: Arc<ProcessorRegistry>) -> Self {
        Self {
            processors,
            futures: Arc::new(ResponseFutureTable::new()),
            handler_pool: HandlerPool::new(config.handler_threads),
            max_frame_length: config.max_frame_length,
            write_queue_size: config.write_queue_size,
        }
    }
}

/// Write handle for one connection
#[derive(Debug, Clone)]
pub struct Channel {
    connection_id: String,
    host_key: String,
    peer_address: SocketAddr,
    sender: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Channel {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Queue a command for writing
    pub async fn send(&self, command: Command) -> Result<(), RemotingError> {
        if !self.is_active() {
            return Err(RemotingError::ConnectionClosed {
                host: self.host_key.clone(),
            });
        }
        self.sender
            .send(command)
            .await
            .map_err(|_| RemotingError::ConnectionClosed {
                host: self.host_key.clone(),
            })
    }

    /// Tear the connection down; both I/O tasks exit
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.send_replace(true);
    }
}

/// Callback run once when a connection's reader exits
pub type OnClose = Box<dyn FnOnce(&Channel) + Send + 'static>;

/// Start the reader and writer tasks for an established stream.
///
/// `host_key` is the `host:port` the node uses to refer to the remote end. Pending
/// futures registered against this connection's id are failed when it drops.
pub fn spawn_connection(
    stream: TcpStream,
    host_key: String,
    context: Arc<ConnectionContext>,
    on_close: Option<OnClose>,
) -> Result<Channel, RemotingError> {
    let peer_address = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let (sender, mut receiver) = mpsc::channel::<Command>(context.write_queue_size.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let channel = Channel {
        connection_id: uuid::Uuid::new_v4().to_string(),
        host_key,
        peer_address,
        sender,
        closed: Arc::new(AtomicBool::new(false)),
        shutdown: Arc::new(shutdown_tx),
    };

    // Writer
    {
        let channel = channel.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let encoder = CommandEncoder;
            let mut buf = BytesMut::new();
            loop {
                tokio::select! {
                    next = receiver.recv() => {
                        let Some(command) = next else { break };
                        buf.clear();
                        if let Err(e) = encoder.encode(&command, &mut buf) {
                            error!(command = %command, error = %e, "Failed to encode command");
                            continue;
                        }
                        if let Err(e) = write_half.write_all(&buf).await {
                            warn!(
                                connection_id = %channel.connection_id,
                                peer = %channel.peer_address,
                                error = %e,
                                "Write failed, closing connection"
                            );
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            channel.close();
            let _ = write_half.shutdown().await;
        });
    }

    // Reader
    {
        let channel = channel.clone();
        let mut shutdown_rx = shutdown_rx;
        tokio::spawn(async move {
            let peer = PeerInfo {
                connection_id: channel.connection_id.clone(),
                address: channel.peer_address,
            };
            let mut decoder = CommandDecoder::new(context.max_frame_length);
            let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

            loop {
                tokio::select! {
                    read = read_half.read_buf(&mut buf) => {
                        match read {
                            Ok(0) => {
                                debug!(connection_id = %channel.connection_id, "Connection closed by peer");
                                break;
                            }
                            Ok(_) => {
                                match decoder.decode_all(&mut buf) {
                                    Ok(commands) => {
                                        for command in commands {
                                            dispatch_inbound(&context, &channel, &peer, command);
                                        }
                                    }
                                    Err(e) => {
                                        error!(
                                            connection_id = %channel.connection_id,
                                            peer = %channel.peer_address,
                                            error = %e,
                                            "Corrupt frame, closing connection"
                                        );
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(
                                    connection_id = %channel.connection_id,
                                    error = %e,
                                    "Read failed, closing connection"
                                );
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            channel.close();
            let failed = context.futures.fail_connection(&channel.connection_id);
            if failed > 0 {
                info!(
                    host = %channel.host_key,
                    connection_id = %channel.connection_id,
                    failed = failed,
                    "Failed pending requests of closed connection"
                );
            }
            if let Some(on_close) = on_close {
                on_close(&channel);
            }
        });
    }

    Ok(channel)
}

fn dispatch_inbound(
    context: &Arc<ConnectionContext>,
    channel: &Channel,
    peer: &PeerInfo,
    command: Command,
) {
    if command.is_response() {
        context.futures.complete(command);
        return;
    }

    let processors = context.processors.clone();
    let channel = channel.clone();
    let peer = peer.clone();
    context.handler_pool.submit(async move {
        let command_type = command.command_type();
        match processors.route(command, &peer).await {
            Ok(Some(reply)) => {
                if let Err(e) = channel.send(reply).await {
                    warn!(command_type = %command_type, error = %e, "Failed to send reply");
                }
            }
            Ok(None) => {}
            Err(ProcessorError::ProcessorNotFound { command_type }) => {
                warn!(
                    command_type = %command_type,
                    peer = %peer.address,
                    "No processor for inbound command, dropping"
                );
            }
            // Already logged by the registry; the caller will time out.
            Err(_) => {}
        }
    });
}
