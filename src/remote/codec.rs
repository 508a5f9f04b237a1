//! Binary framing for [`Command`]s
//!
//! ```text
//! +-------+------+-------------+--------------+------------------+
//! | magic | type |   opaque    | body length  |       body       |
//! |  1B   |  1B  | 8B (BE i64) | 4B (BE u32)  | body length bytes|
//! +-------+------+-------------+--------------+------------------+
//! ```
//!
//! The decoder is resumable: it consumes whole fields as they become available
//! and remembers where it stopped, so a frame split across any number of socket
//! reads decodes exactly like one delivered in a single read.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::command::{Command, CommandType, HEADER_LENGTH, MAGIC};
use super::errors::ProtocolError;

/// Default upper bound for a single frame body (16 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Stateless frame writer
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandEncoder;

impl CommandEncoder {
    pub fn encode(&self, command: &Command, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = command.body();
        let length = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            length: body.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(HEADER_LENGTH + body.len());
        dst.put_u8(MAGIC);
        dst.put_u8(command.command_type().ordinal());
        dst.put_i64(command.opaque());
        dst.put_u32(length);
        dst.put_slice(body);
        Ok(())
    }

    pub fn encode_to_bytes(&self, command: &Command) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + command.body().len());
        self.encode(command, &mut buf)?;
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Magic,
    Type,
    Opaque,
    Length,
    Body,
}

/// Resumable frame reader, one per connection
#[derive(Debug)]
pub struct CommandDecoder {
    state: DecodeState,
    max_frame_length: usize,
    command_type: CommandType,
    opaque: i64,
    body_length: usize,
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl CommandDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            state: DecodeState::Magic,
            max_frame_length,
            command_type: CommandType::Ping,
            opaque: 0,
            body_length: 0,
        }
    }

    /// Decode at most one command from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are removed
    /// from `src` and the partial progress is kept in the decoder.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Magic => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let magic = src.get_u8();
                    if magic != MAGIC {
                        return Err(ProtocolError::MagicMismatch {
                            expected: MAGIC,
                            actual: magic,
                        });
                    }
                    self.state = DecodeState::Type;
                }
                DecodeState::Type => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    self.command_type = CommandType::from_ordinal(src.get_u8())?;
                    self.state = DecodeState::Opaque;
                }
                DecodeState::Opaque => {
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    self.opaque = src.get_i64();
                    self.state = DecodeState::Length;
                }
                DecodeState::Length => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let length = src.get_u32() as usize;
                    if length > self.max_frame_length {
                        return Err(ProtocolError::FrameTooLarge {
                            length,
                            max: self.max_frame_length,
                        });
                    }
                    self.body_length = length;
                    self.state = DecodeState::Body;
                }
                DecodeState::Body => {
                    if src.len() < self.body_length {
                        src.reserve(self.body_length - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(self.body_length).freeze();
                    self.state = DecodeState::Magic;
                    return Ok(Some(Command::with_opaque(
                        self.command_type,
                        self.opaque,
                        body,
                    )));
                }
            }
        }
    }

    /// Drain every complete command currently buffered in `src`
    pub fn decode_all(&mut self, src: &mut BytesMut) -> Result<Vec<Command>, ProtocolError> {
        let mut commands = Vec::new();
        while let Some(command) = self.decode(src)? {
            commands.push(command);
        }
        Ok(commands)
    }

    /// True when no frame is partially consumed
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Magic
    }
}
