//! Command Infrastructure for the Master/Worker RPC Transport
//!
//! A [`Command`] is the unit that travels over a connection: a type byte, a
//! 64-bit opaque id used to correlate replies with requests, and an opaque body.
//! The transport never looks inside the body; typed messages implementing
//! [`CommandBody`] are serialized into it by the layers above.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use super::errors::ProtocolError;

/// First byte of every frame. A mismatch means the stream is out of sync.
pub const MAGIC: u8 = 0xbe;

/// magic(1) + type(1) + opaque(8) + body length(4)
pub const HEADER_LENGTH: usize = 14;

static NEXT_OPAQUE: AtomicI64 = AtomicI64::new(1);

/// Allocate a fresh opaque id.
///
/// Ids increase monotonically for the life of the process, so an id is never
/// handed out again while an earlier request carrying it could still be pending.
pub fn next_opaque() -> i64 {
    NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

/// Command kinds understood by masters and workers.
///
/// The discriminant is the wire ordinal. New kinds are appended; existing
/// ordinals never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum CommandType {
    Ping = 0,
    Pong = 1,
    HeartBeat = 2,
    /// Master asks a worker to run a task instance
    TaskDispatchRequest = 3,
    /// Worker accepts or rejects a dispatch
    TaskDispatchResponse = 4,
    /// Worker reports that a task started running
    TaskExecuteRunning = 5,
    TaskExecuteRunningAck = 6,
    /// Worker reports the final outcome of a task
    TaskExecuteResult = 7,
    TaskExecuteResultAck = 8,
    TaskKillRequest = 9,
    TaskKillResponse = 10,
}

impl CommandType {
    pub const ALL: [CommandType; 11] = [
        CommandType::Ping,
        CommandType::Pong,
        CommandType::HeartBeat,
        CommandType::TaskDispatchRequest,
        CommandType::TaskDispatchResponse,
        CommandType::TaskExecuteRunning,
        CommandType::TaskExecuteRunningAck,
        CommandType::TaskExecuteResult,
        CommandType::TaskExecuteResultAck,
        CommandType::TaskKillRequest,
        CommandType::TaskKillResponse,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Result<Self, ProtocolError> {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(ProtocolError::UnknownCommandType(ordinal))
    }

    /// Reply kinds complete a pending request instead of being routed to a processor.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            Self::Pong
                | Self::TaskDispatchResponse
                | Self::TaskExecuteRunningAck
                | Self::TaskExecuteResultAck
                | Self::TaskKillResponse
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::HeartBeat => "heart_beat",
            Self::TaskDispatchRequest => "task_dispatch_request",
            Self::TaskDispatchResponse => "task_dispatch_response",
            Self::TaskExecuteRunning => "task_execute_running",
            Self::TaskExecuteRunningAck => "task_execute_running_ack",
            Self::TaskExecuteResult => "task_execute_result",
            Self::TaskExecuteResultAck => "task_execute_result_ack",
            Self::TaskKillRequest => "task_kill_request",
            Self::TaskKillResponse => "task_kill_response",
        };
        f.write_str(name)
    }
}

/// A single framed message.
///
/// Immutable once built; replies are new commands that echo the request's opaque id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    command_type: CommandType,
    opaque: i64,
    body: Bytes,
}

impl Command {
    /// Build a request with a freshly allocated opaque id
    pub fn new(command_type: CommandType, body: impl Into<Bytes>) -> Self {
        Self {
            command_type,
            opaque: next_opaque(),
            body: body.into(),
        }
    }

    /// Build a command with an explicit opaque id (decoder and tests)
    pub fn with_opaque(command_type: CommandType, opaque: i64, body: impl Into<Bytes>) -> Self {
        Self {
            command_type,
            opaque,
            body: body.into(),
        }
    }

    /// Build the reply to this command, correlated by opaque id
    pub fn reply(&self, command_type: CommandType, body: impl Into<Bytes>) -> Self {
        Self::with_opaque(command_type, self.opaque, body)
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn opaque(&self) -> i64 {
        self.opaque
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_response(&self) -> bool {
        self.command_type.is_response()
    }

    /// Deserialize the body as the typed message declared by `T::COMMAND_TYPE`
    pub fn body_as<T: CommandBody>(&self) -> Result<T, ProtocolError> {
        if self.command_type != T::COMMAND_TYPE {
            return Err(ProtocolError::UnexpectedCommandType {
                expected: T::COMMAND_TYPE,
                actual: self.command_type,
            });
        }
        serde_json::from_slice(&self.body).map_err(|e| ProtocolError::MalformedBody {
            command_type: self.command_type,
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command[type={}, opaque={}, body={}B]",
            self.command_type,
            self.opaque,
            self.body.len()
        )
    }
}

/// A typed message carried in a command body.
pub trait CommandBody: Serialize + DeserializeOwned {
    const COMMAND_TYPE: CommandType;

    fn encode_body(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ProtocolError::MalformedBody {
                command_type: Self::COMMAND_TYPE,
                reason: e.to_string(),
            })
    }

    /// Wrap this message in a new request command
    fn to_command(&self) -> Result<Command, ProtocolError> {
        Ok(Command::new(Self::COMMAND_TYPE, self.encode_body()?))
    }

    /// Wrap this message in a reply to `request`
    fn to_reply(&self, request: &Command) -> Result<Command, ProtocolError> {
        Ok(request.reply(Self::COMMAND_TYPE, self.encode_body()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_are_stable() {
        for (index, command_type) in CommandType::ALL.iter().enumerate() {
            assert_eq!(command_type.ordinal() as usize, index);
            assert_eq!(
                CommandType::from_ordinal(index as u8).unwrap(),
                *command_type
            );
        }
        assert!(matches!(
            CommandType::from_ordinal(200),
            Err(ProtocolError::UnknownCommandType(200))
        ));
    }

    #[test]
    fn test_opaque_ids_are_unique() {
        let first = Command::new(CommandType::Ping, Bytes::new());
        let second = Command::new(CommandType::Ping, Bytes::new());
        assert_ne!(first.opaque(), second.opaque());
    }

    #[test]
    fn test_reply_echoes_opaque() {
        let request = Command::new(CommandType::Ping, Bytes::new());
        let reply = request.reply(CommandType::Pong, Bytes::new());
        assert_eq!(reply.opaque(), request.opaque());
        assert!(reply.is_response());
        assert!(!request.is_response());
    }

    #[test]
    fn test_body_type_mismatch_is_rejected() {
        use crate::remote::messages::TaskKillRequest;

        let command = Command::new(CommandType::Ping, Bytes::from_static(b"{}"));
        let result = command.body_as::<TaskKillRequest>();
        assert!(matches!(
            result,
            Err(ProtocolError::UnexpectedCommandType { .. })
        ));
    }
}
