use super::UNBOUNDED_COUNT;
use crate::database::Database;
use crate::error::{ClientError, Result};
use crate::lock::Lock;
use latchkey_protocol::{LockKey, LockResultCommand};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Many readers or one writer on a key.
///
/// Readers share the key through an unbounded count, each with its own id;
/// [`release_read`](Self::release_read) always gives back the oldest read
/// still held. The writer is an exclusive lock whose id is kept across
/// acquire/release cycles.
pub struct ReadWriteLock {
    db: Database,
    key: LockKey,
    timeout: u32,
    expire: u32,
    write: Mutex<Option<Lock>>,
    reads: Mutex<VecDeque<Lock>>,
}

impl ReadWriteLock {
    pub fn new(db: Database, key: LockKey, timeout: u32, expire: u32) -> Self {
        Self {
            db,
            key,
            timeout,
            expire,
            write: Mutex::new(None),
            reads: Mutex::new(VecDeque::new()),
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Read locks held by this handle.
    pub fn read_count(&self) -> usize {
        self.reads.lock().len()
    }

    pub async fn acquire_read(&self) -> Result<LockResultCommand> {
        let lock = Lock::new(
            self.db.clone(),
            self.key,
            self.db.next_id(),
            self.timeout,
            self.expire,
        )
        .with_count(UNBOUNDED_COUNT);
        let result = lock.acquire().await?;
        self.reads.lock().push_back(lock);
        Ok(result)
    }

    pub async fn release_read(&self) -> Result<LockResultCommand> {
        let lock = self
            .reads
            .lock()
            .pop_front()
            .ok_or_else(ClientError::not_held)?;
        match lock.release().await {
            Ok(result) => Ok(result),
            Err(e) => {
                // Keep it queued unless the server says it is already gone
                if !e.is_unlocked() {
                    self.reads.lock().push_front(lock);
                }
                Err(e)
            }
        }
    }

    fn writer(&self) -> Lock {
        self.write
            .lock()
            .get_or_insert_with(|| {
                Lock::new(
                    self.db.clone(),
                    self.key,
                    self.db.next_id(),
                    self.timeout,
                    self.expire,
                )
            })
            .clone()
    }

    pub async fn acquire_write(&self) -> Result<LockResultCommand> {
        self.writer().acquire().await
    }

    pub async fn release_write(&self) -> Result<LockResultCommand> {
        let lock = self
            .write
            .lock()
            .clone()
            .ok_or_else(ClientError::not_held)?;
        lock.release().await
    }
}
