//! Per-database handle and primitive factories

use crate::client::CommandSender;
use crate::error::Result;
use crate::lock::Lock;
use crate::primitives::{
    Event, GroupEvent, MaxConcurrentFlow, PriorityLock, ReadWriteLock, ReentrantLock, Semaphore,
    TokenBucketFlow, TreeLock,
};
use latchkey_protocol::{IdGenerator, Ident, LockKey};
use std::fmt;
use std::sync::Arc;

/// A database id on a connected client. Cheap to clone.
///
/// Timeouts and expires passed to the factories are packed wire words; a
/// plain integer means seconds.
#[derive(Clone)]
pub struct Database {
    db_id: u8,
    sender: Arc<dyn CommandSender>,
    ids: Arc<IdGenerator>,
    default_timeout: u16,
    default_expire: u16,
}

impl Database {
    pub fn new(
        db_id: u8,
        sender: Arc<dyn CommandSender>,
        ids: Arc<IdGenerator>,
        default_timeout: u16,
        default_expire: u16,
    ) -> Self {
        Self {
            db_id,
            sender,
            ids,
            default_timeout,
            default_expire,
        }
    }

    pub fn db_id(&self) -> u8 {
        self.db_id
    }

    pub fn sender(&self) -> &Arc<dyn CommandSender> {
        &self.sender
    }

    pub fn next_id(&self) -> Ident {
        self.ids.next_id()
    }

    /// Exclusive lock on `key` with a fresh id.
    pub fn lock(&self, key: impl AsRef<[u8]>, timeout: u32, expire: u32) -> Lock {
        Lock::new(self.clone(), LockKey::new(key), self.next_id(), timeout, expire)
    }

    /// Exclusive lock using the configured default timeout and expire.
    pub fn default_lock(&self, key: impl AsRef<[u8]>) -> Lock {
        self.lock(
            key,
            u32::from(self.default_timeout),
            u32::from(self.default_expire),
        )
    }

    pub fn reentrant_lock(
        &self,
        key: impl AsRef<[u8]>,
        timeout: u32,
        expire: u32,
    ) -> ReentrantLock {
        ReentrantLock::new(self.clone(), LockKey::new(key), timeout, expire)
    }

    pub fn read_write_lock(
        &self,
        key: impl AsRef<[u8]>,
        timeout: u32,
        expire: u32,
    ) -> ReadWriteLock {
        ReadWriteLock::new(self.clone(), LockKey::new(key), timeout, expire)
    }

    pub fn semaphore(
        &self,
        key: impl AsRef<[u8]>,
        permits: u16,
        timeout: u32,
        expire: u32,
    ) -> Semaphore {
        Semaphore::new(self.clone(), LockKey::new(key), permits, timeout, expire)
    }

    pub fn max_concurrent_flow(
        &self,
        key: impl AsRef<[u8]>,
        permits: u16,
        timeout: u32,
        expire: u32,
    ) -> MaxConcurrentFlow {
        MaxConcurrentFlow::new(self.clone(), LockKey::new(key), permits, timeout, expire)
    }

    /// Rate limiter admitting `permits` acquisitions per `period` seconds.
    pub fn token_bucket_flow(
        &self,
        key: impl AsRef<[u8]>,
        permits: u16,
        timeout: u32,
        period: f64,
    ) -> Result<TokenBucketFlow> {
        TokenBucketFlow::new(self.clone(), LockKey::new(key), permits, timeout, period)
    }

    /// Root of a lock tree.
    pub fn tree_lock(&self, key: impl AsRef<[u8]>, timeout: u32, expire: u32) -> TreeLock {
        TreeLock::new(self.clone(), LockKey::new(key), timeout, expire)
    }

    pub fn event(
        &self,
        key: impl AsRef<[u8]>,
        timeout: u32,
        expire: u32,
        default_set: bool,
    ) -> Event {
        Event::new(self.clone(), LockKey::new(key), timeout, expire, default_set)
    }

    pub fn group_event(
        &self,
        key: impl AsRef<[u8]>,
        client_id: u64,
        version: u64,
        timeout: u32,
        expire: u32,
    ) -> GroupEvent {
        GroupEvent::new(
            self.clone(),
            LockKey::new(key),
            client_id,
            version,
            timeout,
            expire,
        )
    }

    pub fn priority_lock(
        &self,
        key: impl AsRef<[u8]>,
        priority: u8,
        timeout: u32,
        expire: u32,
    ) -> PriorityLock {
        PriorityLock::new(self.clone(), LockKey::new(key), priority, timeout, expire)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("db_id", &self.db_id).finish()
    }
}

/// A sender that records lock commands and answers from a script, for
/// checking primitive encodings without a server.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use crate::error::Result;
    use crate::scheduler::Callback;
    use async_trait::async_trait;
    use latchkey_protocol::{CommandResult, LockCommand, LockResultCommand, RequestCommand};
    use parking_lot::Mutex;

    type Script = Box<dyn Fn(&LockCommand) -> (u8, Ident) + Send + Sync>;

    pub(crate) struct ScriptedSender {
        sent: Mutex<Vec<LockCommand>>,
        script: Script,
    }

    impl ScriptedSender {
        pub(crate) fn sent(&self) -> Vec<LockCommand> {
            self.sent.lock().clone()
        }

        fn answer(&self, command: RequestCommand) -> CommandResult {
            let RequestCommand::Lock(command) = command else {
                panic!("only lock commands are scripted");
            };
            self.sent.lock().push(command);
            let (result, lock_id) = (self.script)(&command);
            CommandResult::Lock(LockResultCommand {
                command_type: command.command_type,
                request_id: command.request_id,
                result,
                flag: command.flag,
                db_id: command.db_id,
                lock_id,
                lock_key: command.lock_key,
                local_count: 0,
                count: command.count,
                local_r_count: 0,
                r_count: command.r_count,
            })
        }
    }

    #[async_trait]
    impl CommandSender for ScriptedSender {
        async fn send_command(&self, command: RequestCommand) -> Result<CommandResult> {
            Ok(self.answer(command))
        }

        fn send_command_with_callback(&self, command: RequestCommand, callback: Callback) {
            callback(Ok(self.answer(command)));
        }
    }

    /// Database 0 over a sender answering with `script(command)`.
    pub(crate) fn database<F>(script: F) -> (Database, Arc<ScriptedSender>)
    where
        F: Fn(&LockCommand) -> (u8, Ident) + Send + Sync + 'static,
    {
        let sender = Arc::new(ScriptedSender {
            sent: Mutex::new(Vec::new()),
            script: Box::new(script),
        });
        let db = Database::new(0, sender.clone(), Arc::new(IdGenerator::new()), 5, 5);
        (db, sender)
    }
}
