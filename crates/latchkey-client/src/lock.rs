//! The acquire/release RPC every primitive is built from

use crate::database::Database;
use crate::error::{ClientError, Result};
use latchkey_protocol::{
    codes, flags, CommandResult, CommandType, Ident, LockCommand, LockKey, LockResultCommand,
    RequestCommand,
};
use std::fmt;

/// A (key, id, timeout, expire, count, rCount) tuple bound to a database.
///
/// `timeout` and `expire` are packed wire words: seconds in the low half
/// unless a unit modifier in the high half says otherwise (see
/// [`flags::pack`]). Cloning is cheap and keeps the same lock id.
#[derive(Clone)]
pub struct Lock {
    db: Database,
    key: LockKey,
    id: Ident,
    timeout: u32,
    expire: u32,
    count: u16,
    r_count: u8,
}

impl Lock {
    pub fn new(db: Database, key: LockKey, id: Ident, timeout: u32, expire: u32) -> Self {
        Self {
            db,
            key,
            id,
            timeout,
            expire,
            count: 0,
            r_count: 0,
        }
    }

    pub fn with_id(mut self, id: Ident) -> Self {
        self.id = id;
        self
    }

    pub fn with_count(mut self, count: u16) -> Self {
        self.count = count;
        self
    }

    pub fn with_r_count(mut self, r_count: u8) -> Self {
        self.r_count = r_count;
        self
    }

    pub fn with_timeout(mut self, timeout: u32) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expire(mut self, expire: u32) -> Self {
        self.expire = expire;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn id(&self) -> Ident {
        self.id
    }

    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    pub fn expire(&self) -> u32 {
        self.expire
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn r_count(&self) -> u8 {
        self.r_count
    }

    /// Frame for this lock with a fresh request id.
    pub fn command(&self, command_type: CommandType, flag: u8) -> LockCommand {
        LockCommand {
            command_type,
            request_id: self.db.next_id(),
            flag,
            db_id: self.db.db_id(),
            lock_id: self.id,
            lock_key: self.key,
            timeout: self.timeout,
            expire: self.expire,
            count: self.count,
            r_count: self.r_count,
        }
    }

    pub async fn acquire(&self) -> Result<LockResultCommand> {
        self.acquire_with_flag(0).await
    }

    pub async fn acquire_with_flag(&self, flag: u8) -> Result<LockResultCommand> {
        self.execute(self.command(CommandType::Lock, flag)).await
    }

    pub async fn release(&self) -> Result<LockResultCommand> {
        self.release_with_flag(0).await
    }

    pub async fn release_with_flag(&self, flag: u8) -> Result<LockResultCommand> {
        self.execute(self.command(CommandType::Unlock, flag)).await
    }

    /// Acquires, or refreshes timeout and expire if this id already holds it.
    pub async fn update(&self) -> Result<LockResultCommand> {
        self.acquire_with_flag(flags::lock::UPDATE_WHEN_LOCKED).await
    }

    /// Acquires; when locked, the error carries the current holder's id.
    pub async fn show(&self) -> Result<LockResultCommand> {
        self.acquire_with_flag(flags::lock::SHOW_WHEN_LOCKED).await
    }

    /// Releases the oldest holder of this key, whoever it is.
    pub async fn release_head(&self) -> Result<LockResultCommand> {
        self.execute(self.release_head_command()).await
    }

    pub(crate) fn release_head_command(&self) -> LockCommand {
        LockCommand {
            lock_id: Ident::ZERO,
            ..self.command(
                CommandType::Unlock,
                flags::unlock::UNLOCK_FIRST_LOCK_WHEN_UNLOCKED,
            )
        }
    }

    pub fn acquire_with_callback<F>(&self, flag: u8, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.execute_with_callback(self.command(CommandType::Lock, flag), callback);
    }

    pub fn release_with_callback<F>(&self, flag: u8, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.execute_with_callback(self.command(CommandType::Unlock, flag), callback);
    }

    pub(crate) async fn execute(&self, command: LockCommand) -> Result<LockResultCommand> {
        let result = self
            .db
            .sender()
            .send_command(RequestCommand::Lock(command))
            .await?;
        lock_outcome(result)
    }

    pub(crate) fn execute_with_callback<F>(&self, command: LockCommand, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.db.sender().send_command_with_callback(
            RequestCommand::Lock(command),
            Box::new(move |outcome| callback(outcome.and_then(lock_outcome))),
        );
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("db_id", &self.db.db_id())
            .field("key", &self.key)
            .field("id", &self.id)
            .field("timeout", &format_args!("{:#010x}", self.timeout))
            .field("expire", &format_args!("{:#010x}", self.expire))
            .field("count", &self.count)
            .field("r_count", &self.r_count)
            .finish()
    }
}

/// Maps a server answer to the lock result or its typed failure.
pub(crate) fn lock_outcome(result: CommandResult) -> Result<LockResultCommand> {
    match result {
        CommandResult::Lock(result) if result.result == codes::SUCCESS => Ok(result),
        CommandResult::Lock(result) => Err(ClientError::from_lock_result(result)),
        other => Err(ClientError::UnexpectedResponse(format!(
            "expected lock result, got {:?}",
            other
        ))),
    }
}

/// Treats one failure kind as success, the way primitives absorb benign
/// outcomes ("already clear", "already set").
pub(crate) fn tolerate<T>(
    outcome: Result<T>,
    benign: fn(&ClientError) -> bool,
) -> Result<Option<T>> {
    match outcome {
        Ok(value) => Ok(Some(value)),
        Err(e) if benign(&e) => Ok(None),
        Err(e) => Err(e),
    }
}
