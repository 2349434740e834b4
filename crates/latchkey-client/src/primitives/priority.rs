use crate::database::Database;
use crate::error::Result;
use crate::lock::Lock;
use latchkey_protocol::{flags, LockKey, LockResultCommand};

/// Exclusive lock whose waiters are served highest priority first.
#[derive(Clone, Debug)]
pub struct PriorityLock {
    lock: Lock,
    priority: u8,
}

impl PriorityLock {
    pub fn new(db: Database, key: LockKey, priority: u8, timeout: u32, expire: u32) -> Self {
        let id = db.next_id();
        let lock = Lock::new(
            db,
            key,
            id,
            flags::with_modifiers(timeout, flags::timeout::RCOUNT_IS_PRIORITY),
            expire,
        )
        .with_r_count(priority);
        Self { lock, priority }
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    pub async fn acquire(&self) -> Result<LockResultCommand> {
        self.lock.acquire().await
    }

    pub async fn release(&self) -> Result<LockResultCommand> {
        self.lock.release().await
    }

    pub fn acquire_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.lock.acquire_with_callback(0, callback);
    }

    pub fn release_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.lock.release_with_callback(0, callback);
    }
}
