//! Error types for the lock client

use latchkey_protocol::{codes, LockResultCommand, ProtocolError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure kind reported by the server for a lock or unlock command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockErrorKind {
    /// The key is held and the request could not join the holders
    Locked,
    /// Release of a lock that is not held
    Unlocked,
    /// Release by an id that does not own the lock
    NotOwner,
    /// The server gave up waiting for the lock
    Timeout,
    /// The lock expired while waiting
    Expired,
    /// The server reported an inconsistent lock state
    State,
    /// Any other non-success code
    Other,
}

impl LockErrorKind {
    /// Maps a result code; `None` means success.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            codes::SUCCESS => None,
            codes::LOCKED_ERROR => Some(Self::Locked),
            codes::UNLOCK_ERROR => Some(Self::Unlocked),
            codes::NOT_OWNER_ERROR => Some(Self::NotOwner),
            codes::TIMEOUT => Some(Self::Timeout),
            codes::EXPIRED => Some(Self::Expired),
            codes::STATE_ERROR => Some(Self::State),
            _ => Some(Self::Other),
        }
    }
}

impl fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Locked => "already locked",
            Self::Unlocked => "not locked",
            Self::NotOwner => "caller does not own this lock",
            Self::Timeout => "timed out waiting for the lock",
            Self::Expired => "lock expired",
            Self::State => "lock state error",
            Self::Other => "lock command failed",
        };
        f.write_str(text)
    }
}

/// Errors that can occur while talking to the lock server
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live connection to route the command to
    #[error("not connected to any lock server")]
    Unconnected,

    /// The connection went away while the command was pending
    #[error("connection closed")]
    ConnectionClosed,

    /// Writing the command frame failed; the connection is torn down
    #[error("failed to write command: {0}")]
    Write(#[source] std::io::Error),

    /// Socket-level errors while connecting or reading
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server rejected or garbled the session handshake
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No response arrived within the local wait bound
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The server answered with a non-success result code
    #[error("{kind} (result code {code})")]
    Lock {
        kind: LockErrorKind,
        code: u8,
        result: Option<Box<LockResultCommand>>,
    },

    /// Malformed inbound frame
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A result of the wrong type answered a request
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Builds the error for a non-success lock result.
    pub fn from_lock_result(result: LockResultCommand) -> Self {
        Self::Lock {
            kind: LockErrorKind::from_code(result.result).unwrap_or(LockErrorKind::Other),
            code: result.result,
            result: Some(Box::new(result)),
        }
    }

    /// Local "not locked" failure for releasing something never acquired.
    pub(crate) fn not_held() -> Self {
        Self::Lock {
            kind: LockErrorKind::Unlocked,
            code: codes::UNLOCK_ERROR,
            result: None,
        }
    }

    /// Server-reported failure kind, if this is a lock failure.
    pub fn lock_kind(&self) -> Option<LockErrorKind> {
        match self {
            Self::Lock { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The result frame that accompanied a lock failure.
    pub fn lock_result(&self) -> Option<&LockResultCommand> {
        match self {
            Self::Lock { result, .. } => result.as_deref(),
            _ => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_kind() == Some(LockErrorKind::Locked)
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_kind() == Some(LockErrorKind::Unlocked)
    }

    /// True for both server-side wait timeouts and local response timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_)) || self.lock_kind() == Some(LockErrorKind::Timeout)
    }

    /// Transport failures, as opposed to answers from the server.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Unconnected | Self::ConnectionClosed | Self::Write(_) | Self::Io(_)
        )
    }
}
