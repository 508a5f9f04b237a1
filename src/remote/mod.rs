//! # Remoting
//!
//! Binary command transport between masters and workers: framing, typed
//! message bodies, request/response correlation and inbound dispatch.

pub mod client;
pub mod codec;
pub mod command;
pub mod connection;
pub mod errors;
pub mod future;
pub mod messages;
pub mod processor;
pub mod server;

pub use client::RemotingClient;
pub use codec::{CommandDecoder, CommandEncoder, DEFAULT_MAX_FRAME_LENGTH};
pub use command::{next_opaque, Command, CommandBody, CommandType, HEADER_LENGTH, MAGIC};
pub use connection::{Channel, ConnectionContext};
pub use errors::{ProtocolError, RemotingError};
pub use future::{ResponseFuture, ResponseFutureTable};
pub use processor::{
    CommandProcessor, HandlerPool, PeerInfo, PingProcessor, ProcessorError, ProcessorRegistry,
    ProcessorRegistryStats,
};
pub use server::RemotingServer;
