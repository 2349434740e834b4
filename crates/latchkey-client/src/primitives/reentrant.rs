use super::REENTRANT_R_COUNT;
use crate::database::Database;
use crate::error::{ClientError, Result};
use crate::lock::Lock;
use latchkey_protocol::{LockKey, LockResultCommand};
use parking_lot::Mutex;

#[derive(Default)]
struct Depth {
    lock: Option<Lock>,
    depth: u32,
}

/// A lock the same holder may take repeatedly.
///
/// Nested acquires reuse one lock id so the server counts the recursion. The
/// id is dropped once every acquire has been matched by a release; the next
/// outermost acquire gets a fresh one.
pub struct ReentrantLock {
    db: Database,
    key: LockKey,
    timeout: u32,
    expire: u32,
    state: Mutex<Depth>,
}

impl ReentrantLock {
    pub fn new(db: Database, key: LockKey, timeout: u32, expire: u32) -> Self {
        Self {
            db,
            key,
            timeout,
            expire,
            state: Mutex::new(Depth::default()),
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Acquires not yet matched by a release.
    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    fn current(&self) -> Lock {
        let mut state = self.state.lock();
        state
            .lock
            .get_or_insert_with(|| {
                Lock::new(
                    self.db.clone(),
                    self.key,
                    self.db.next_id(),
                    self.timeout,
                    self.expire,
                )
                .with_r_count(REENTRANT_R_COUNT)
            })
            .clone()
    }

    pub async fn acquire(&self) -> Result<LockResultCommand> {
        let lock = self.current();
        let result = lock.acquire().await?;
        self.state.lock().depth += 1;
        Ok(result)
    }

    pub async fn release(&self) -> Result<LockResultCommand> {
        let lock = self
            .state
            .lock()
            .lock
            .clone()
            .ok_or_else(ClientError::not_held)?;
        let result = lock.release().await?;

        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.lock = None;
        }
        Ok(result)
    }
}
