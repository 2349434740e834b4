//! Fixed-size command and result frames

use crate::error::{ProtocolError, Result};
use crate::flags;
use crate::{Ident, LockKey};
use std::time::Duration;

/// Size of every frame on the wire.
pub const FRAME_SIZE: usize = 64;

/// Magic, version, command type and request id.
pub const HEADER_SIZE: usize = 19;

pub const MAGIC: u8 = 0x56;
pub const VERSION: u8 = 0x01;

/// Command type byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    Init = 0,
    Lock = 1,
    Unlock = 2,
    Ping = 5,
}

impl TryFrom<u8> for CommandType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Init),
            1 => Ok(Self::Lock),
            2 => Ok(Self::Unlock),
            5 => Ok(Self::Ping),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// A message that maps to exactly one 64-byte frame.
pub trait Frame: Sized {
    fn encode(&self) -> [u8; FRAME_SIZE];

    /// Returns `None` for short input or a frame of another type.
    fn decode(frame: &[u8]) -> Option<Self>;

    fn request_id(&self) -> Ident;
}

struct FrameWriter {
    buf: [u8; FRAME_SIZE],
    pos: usize,
}

impl FrameWriter {
    fn new(command_type: CommandType, request_id: &Ident) -> Self {
        let mut writer = Self {
            buf: [0; FRAME_SIZE],
            pos: 0,
        };
        writer.put_u8(MAGIC);
        writer.put_u8(VERSION);
        writer.put_u8(command_type as u8);
        writer.put_16(request_id.as_bytes());
        writer
    }

    fn put_u8(&mut self, value: u8) {
        self.buf[self.pos] = value;
        self.pos += 1;
    }

    fn put_16(&mut self, bytes: &[u8; 16]) {
        self.buf[self.pos..self.pos + 16].copy_from_slice(bytes);
        self.pos += 16;
    }

    fn put_u16(&mut self, value: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&value.to_le_bytes());
        self.pos += 2;
    }

    fn put_u32(&mut self, value: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&value.to_le_bytes());
        self.pos += 4;
    }

    fn finish(self) -> [u8; FRAME_SIZE] {
        self.buf
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Validates the header and positions the reader at the payload.
    fn open(frame: &'a [u8], accepts: &[CommandType]) -> Option<(Self, CommandType, Ident)> {
        if frame.len() < FRAME_SIZE || frame[0] != MAGIC || frame[1] != VERSION {
            return None;
        }
        let command_type = CommandType::try_from(frame[2]).ok()?;
        if !accepts.contains(&command_type) {
            return None;
        }
        let mut reader = Self {
            buf: &frame[..FRAME_SIZE],
            pos: 3,
        };
        let request_id = Ident::from_bytes(reader.get_16());
        Some((reader, command_type, request_id))
    }

    fn get_u8(&mut self) -> u8 {
        let value = self.buf[self.pos];
        self.pos += 1;
        value
    }

    fn get_16(&mut self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 16]);
        self.pos += 16;
        bytes
    }

    fn get_u16(&mut self) -> u16 {
        let value = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        value
    }

    fn get_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        u32::from_le_bytes(bytes)
    }
}

/// Session handshake sent before any other traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitCommand {
    pub request_id: Ident,
    pub client_id: Ident,
}

impl Frame for InitCommand {
    fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut writer = FrameWriter::new(CommandType::Init, &self.request_id);
        writer.put_16(self.client_id.as_bytes());
        writer.finish()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        let (mut reader, _, request_id) = FrameReader::open(frame, &[CommandType::Init])?;
        Some(Self {
            request_id,
            client_id: Ident::from_bytes(reader.get_16()),
        })
    }

    fn request_id(&self) -> Ident {
        self.request_id
    }
}

/// Handshake reply. `init_type` 0 is a fresh session, 1 a resumed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitResultCommand {
    pub request_id: Ident,
    pub result: u8,
    pub init_type: u8,
}

impl Frame for InitResultCommand {
    fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut writer = FrameWriter::new(CommandType::Init, &self.request_id);
        writer.put_u8(self.result);
        writer.put_u8(self.init_type);
        writer.finish()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        let (mut reader, _, request_id) = FrameReader::open(frame, &[CommandType::Init])?;
        Some(Self {
            request_id,
            result: reader.get_u8(),
            init_type: reader.get_u8(),
        })
    }

    fn request_id(&self) -> Ident {
        self.request_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingCommand {
    pub request_id: Ident,
}

impl Frame for PingCommand {
    fn encode(&self) -> [u8; FRAME_SIZE] {
        FrameWriter::new(CommandType::Ping, &self.request_id).finish()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        let (_, _, request_id) = FrameReader::open(frame, &[CommandType::Ping])?;
        Some(Self { request_id })
    }

    fn request_id(&self) -> Ident {
        self.request_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResultCommand {
    pub request_id: Ident,
    pub result: u8,
}

impl Frame for PingResultCommand {
    fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut writer = FrameWriter::new(CommandType::Ping, &self.request_id);
        writer.put_u8(self.result);
        writer.finish()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        let (mut reader, _, request_id) = FrameReader::open(frame, &[CommandType::Ping])?;
        Some(Self {
            request_id,
            result: reader.get_u8(),
        })
    }

    fn request_id(&self) -> Ident {
        self.request_id
    }
}

/// Acquire (`CommandType::Lock`) or release (`CommandType::Unlock`) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockCommand {
    pub command_type: CommandType,
    pub request_id: Ident,
    pub flag: u8,
    pub db_id: u8,
    pub lock_id: Ident,
    pub lock_key: LockKey,
    pub timeout: u32,
    pub expire: u32,
    pub count: u16,
    pub r_count: u8,
}

impl LockCommand {
    /// How long the server may hold this request before answering.
    pub fn wait_duration(&self) -> Duration {
        let value = flags::value(self.timeout) as u64;
        let modifiers = flags::modifiers(self.timeout);
        if modifiers & flags::timeout::MILLISECOND_TIME != 0 {
            Duration::from_millis(value)
        } else if modifiers & flags::timeout::MINUTE_TIME != 0 {
            Duration::from_secs(value * 60)
        } else {
            Duration::from_secs(value)
        }
    }
}

impl Frame for LockCommand {
    fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut writer = FrameWriter::new(self.command_type, &self.request_id);
        writer.put_u8(self.flag);
        writer.put_u8(self.db_id);
        writer.put_16(self.lock_id.as_bytes());
        writer.put_16(self.lock_key.as_bytes());
        writer.put_u32(self.timeout);
        writer.put_u32(self.expire);
        writer.put_u16(self.count);
        writer.put_u8(self.r_count);
        writer.finish()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        let (mut reader, command_type, request_id) =
            FrameReader::open(frame, &[CommandType::Lock, CommandType::Unlock])?;
        Some(Self {
            command_type,
            request_id,
            flag: reader.get_u8(),
            db_id: reader.get_u8(),
            lock_id: Ident::from_bytes(reader.get_16()),
            lock_key: LockKey::from_normalized(reader.get_16()),
            timeout: reader.get_u32(),
            expire: reader.get_u32(),
            count: reader.get_u16(),
            r_count: reader.get_u8(),
        })
    }

    fn request_id(&self) -> Ident {
        self.request_id
    }
}

/// Reply to a [`LockCommand`], echoing the request fields plus server counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockResultCommand {
    pub command_type: CommandType,
    pub request_id: Ident,
    pub result: u8,
    pub flag: u8,
    pub db_id: u8,
    pub lock_id: Ident,
    pub lock_key: LockKey,
    pub local_count: u16,
    pub count: u16,
    pub local_r_count: u8,
    pub r_count: u8,
}

impl Frame for LockResultCommand {
    fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut writer = FrameWriter::new(self.command_type, &self.request_id);
        writer.put_u8(self.result);
        writer.put_u8(self.flag);
        writer.put_u8(self.db_id);
        writer.put_16(self.lock_id.as_bytes());
        writer.put_16(self.lock_key.as_bytes());
        writer.put_u16(self.local_count);
        writer.put_u16(self.count);
        writer.put_u8(self.local_r_count);
        writer.put_u8(self.r_count);
        // trailing 4 bytes reserved
        writer.finish()
    }

    fn decode(frame: &[u8]) -> Option<Self> {
        let (mut reader, command_type, request_id) =
            FrameReader::open(frame, &[CommandType::Lock, CommandType::Unlock])?;
        Some(Self {
            command_type,
            request_id,
            result: reader.get_u8(),
            flag: reader.get_u8(),
            db_id: reader.get_u8(),
            lock_id: Ident::from_bytes(reader.get_16()),
            lock_key: LockKey::from_normalized(reader.get_16()),
            local_count: reader.get_u16(),
            count: reader.get_u16(),
            local_r_count: reader.get_u8(),
            r_count: reader.get_u8(),
        })
    }

    fn request_id(&self) -> Ident {
        self.request_id
    }
}

/// Any outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCommand {
    Init(InitCommand),
    Ping(PingCommand),
    Lock(LockCommand),
}

impl RequestCommand {
    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        match self {
            Self::Init(command) => command.encode(),
            Self::Ping(command) => command.encode(),
            Self::Lock(command) => command.encode(),
        }
    }

    /// Decodes a request frame, as a server reads it.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        match check_header(frame)? {
            CommandType::Init => InitCommand::decode(frame).map(Self::Init),
            CommandType::Ping => PingCommand::decode(frame).map(Self::Ping),
            CommandType::Lock | CommandType::Unlock => LockCommand::decode(frame).map(Self::Lock),
        }
        .ok_or(ProtocolError::ShortFrame(frame.len()))
    }

    pub fn request_id(&self) -> Ident {
        match self {
            Self::Init(command) => command.request_id,
            Self::Ping(command) => command.request_id,
            Self::Lock(command) => command.request_id,
        }
    }

    /// Server-side wait allowance; zero for commands that answer at once.
    pub fn wait_duration(&self) -> Duration {
        match self {
            Self::Lock(command) => command.wait_duration(),
            _ => Duration::ZERO,
        }
    }
}

/// Any inbound result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Init(InitResultCommand),
    Ping(PingResultCommand),
    Lock(LockResultCommand),
}

impl CommandResult {
    /// Picks the decoder from the command-type byte.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        match check_header(frame)? {
            CommandType::Init => InitResultCommand::decode(frame).map(Self::Init),
            CommandType::Ping => PingResultCommand::decode(frame).map(Self::Ping),
            CommandType::Lock | CommandType::Unlock => {
                LockResultCommand::decode(frame).map(Self::Lock)
            }
        }
        .ok_or(ProtocolError::ShortFrame(frame.len()))
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        match self {
            Self::Init(result) => result.encode(),
            Self::Ping(result) => result.encode(),
            Self::Lock(result) => result.encode(),
        }
    }

    pub fn request_id(&self) -> Ident {
        match self {
            Self::Init(result) => result.request_id,
            Self::Ping(result) => result.request_id,
            Self::Lock(result) => result.request_id,
        }
    }

    pub fn result_code(&self) -> u8 {
        match self {
            Self::Init(result) => result.result,
            Self::Ping(result) => result.result,
            Self::Lock(result) => result.result,
        }
    }
}

fn check_header(frame: &[u8]) -> Result<CommandType> {
    if frame.len() < FRAME_SIZE {
        return Err(ProtocolError::ShortFrame(frame.len()));
    }
    if frame[0] != MAGIC {
        return Err(ProtocolError::UnknownMagic(frame[0]));
    }
    if frame[1] != VERSION {
        return Err(ProtocolError::UnknownVersion(frame[1]));
    }
    CommandType::try_from(frame[2])
}
