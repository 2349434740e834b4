//! Wire protocol for the latchkey lock service.
//!
//! Every message on the wire is a fixed 64-byte frame:
//!
//! ```text
//! +-------+---------+--------------+------------------+---------------------+
//! | magic | version | command type |    request id    |  payload + padding  |
//! |  1B   |   1B    |      1B      |       16B        |         45B         |
//! +-------+---------+--------------+------------------+---------------------+
//! ```
//!
//! There is no length prefix, so a reader always consumes exactly
//! [`FRAME_SIZE`] bytes per message.

mod command;
mod error;
pub mod flags;
mod ident;
mod key;

pub use command::{
    CommandResult, CommandType, Frame, InitCommand, InitResultCommand, LockCommand,
    LockResultCommand, PingCommand, PingResultCommand, RequestCommand, FRAME_SIZE, HEADER_SIZE,
    MAGIC, VERSION,
};
pub use error::{ProtocolError, Result};
pub use ident::{IdGenerator, Ident};
pub use key::{normalize_key, LockKey};

/// Result codes carried in every result frame.
pub mod codes {
    pub const SUCCESS: u8 = 0;
    pub const UNKNOWN_MAGIC: u8 = 1;
    pub const UNKNOWN_VERSION: u8 = 2;
    pub const UNKNOWN_DB: u8 = 3;
    pub const UNKNOWN_COMMAND: u8 = 4;
    pub const LOCKED_ERROR: u8 = 5;
    pub const UNLOCK_ERROR: u8 = 6;
    pub const NOT_OWNER_ERROR: u8 = 7;
    pub const TIMEOUT: u8 = 8;
    pub const EXPIRED: u8 = 9;
    pub const STATE_ERROR: u8 = 10;
    pub const ERROR: u8 = 11;
}

/// Default TCP port of the lock server.
pub const DEFAULT_PORT: u16 = 5658;
