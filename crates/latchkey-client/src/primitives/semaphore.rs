use crate::database::Database;
use crate::error::Result;
use crate::lock::Lock;
use latchkey_protocol::{LockKey, LockResultCommand};

/// Counting semaphore with `permits` slots on one key.
///
/// Every acquire takes a slot under a fresh id. Release frees the oldest
/// held slot, whoever took it, so any process may release.
#[derive(Clone)]
pub struct Semaphore {
    db: Database,
    key: LockKey,
    permits: u16,
    timeout: u32,
    expire: u32,
}

impl Semaphore {
    pub fn new(db: Database, key: LockKey, permits: u16, timeout: u32, expire: u32) -> Self {
        Self {
            db,
            key,
            permits: permits.max(1),
            timeout,
            expire,
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn permits(&self) -> u16 {
        self.permits
    }

    fn slot(&self) -> Lock {
        Lock::new(
            self.db.clone(),
            self.key,
            self.db.next_id(),
            self.timeout,
            self.expire,
        )
        .with_count(self.permits - 1)
    }

    pub async fn acquire(&self) -> Result<LockResultCommand> {
        self.slot().acquire().await
    }

    pub async fn release(&self) -> Result<LockResultCommand> {
        self.slot().release_head().await
    }

    /// Releases slots until none is held; returns how many were freed.
    pub async fn release_all(&self) -> Result<usize> {
        let mut released = 0;
        loop {
            match self.release().await {
                Ok(_) => released += 1,
                Err(e) if e.is_unlocked() => return Ok(released),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn acquire_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.slot().acquire_with_callback(0, callback);
    }

    pub fn release_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        let slot = self.slot();
        slot.execute_with_callback(slot.release_head_command(), callback);
    }
}
