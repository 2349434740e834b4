//! Versioned broadcast wakeup

use crate::database::Database;
use crate::error::{ClientError, Result};
use crate::lock::{tolerate, Lock};
use latchkey_protocol::{flags, Ident, LockKey, LockResultCommand};
use std::sync::atomic::{AtomicU64, Ordering};

/// An event shared by a group of clients, stamped with a version.
///
/// Lock ids are `version ∥ client_id`, both little-endian `u64`. A cleared
/// event is a lock held on the key; each wakeup raises the holder's version
/// and releases every waiter still at an older version. Waiters adopt the
/// version they observe, so the next wait blocks until the next wakeup.
pub struct GroupEvent {
    db: Database,
    key: LockKey,
    client_id: u64,
    version: AtomicU64,
    timeout: u32,
    expire: u32,
}

fn version_of(id: &Ident) -> u64 {
    id.to_u64_pair().0
}

impl GroupEvent {
    pub fn new(
        db: Database,
        key: LockKey,
        client_id: u64,
        version: u64,
        timeout: u32,
        expire: u32,
    ) -> Self {
        Self {
            db,
            key,
            client_id,
            version: AtomicU64::new(version),
            timeout,
            expire,
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Last version this handle observed or produced.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn lock(&self, version: u64, client_id: u64, timeout: u32, expire: u32) -> Lock {
        Lock::new(
            self.db.clone(),
            self.key,
            Ident::from_u64_pair(version, client_id),
            timeout,
            expire,
        )
    }

    fn observe(&self, result: &LockResultCommand) {
        self.version
            .fetch_max(version_of(&result.lock_id), Ordering::AcqRel);
    }

    pub async fn is_set(&self) -> Result<bool> {
        match self
            .lock(self.version(), self.client_id, 0, 0)
            .acquire()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_locked() || e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sets the event, waking every waiter. Already set is fine.
    pub async fn set(&self) -> Result<()> {
        let lock = self.lock(self.version(), self.client_id, self.timeout, self.expire);
        tolerate(lock.release_head().await, ClientError::is_unlocked).map(|_| ())
    }

    /// Clears the event at the current version. Already cleared is fine.
    pub async fn clear(&self) -> Result<()> {
        let lock = self.lock(self.version(), 0, 0, self.expire);
        tolerate(lock.update().await, ClientError::is_locked).map(|_| ())
    }

    /// Raises the version, releasing waiters at older versions.
    ///
    /// If another client already holds a newer version, retries once just
    /// above it. The event stays cleared at the new version.
    pub async fn wakeup(&self) -> Result<LockResultCommand> {
        let timeout = flags::with_modifiers(0, flags::timeout::LESS_LOCK_VERSION_IS_LOCK_SUCCEED);
        let next = self.version() + 1;

        let outcome = self
            .lock(next, self.client_id, timeout, self.expire)
            .update()
            .await;
        let (result, version) = match outcome {
            Ok(result) => (result, next),
            Err(e) if e.is_locked() => {
                let holder = e.lock_result().map(|r| version_of(&r.lock_id)).unwrap_or(next);
                let retry = holder.max(next) + 1;
                let result = self
                    .lock(retry, self.client_id, timeout, self.expire)
                    .update()
                    .await?;
                (result, retry)
            }
            Err(e) => return Err(e),
        };
        self.version.fetch_max(version, Ordering::AcqRel);
        Ok(result)
    }

    /// Waits up to `timeout` for a set or a newer version.
    pub async fn wait(&self, timeout: u32) -> Result<LockResultCommand> {
        let timeout =
            flags::with_modifiers(timeout, flags::timeout::LESS_LOCK_VERSION_IS_LOCK_SUCCEED);
        let result = self
            .lock(self.version(), self.client_id, timeout, 0)
            .acquire()
            .await?;
        self.observe(&result);
        Ok(result)
    }

    /// Like [`wait`](Self::wait), but on timeout clears the event and takes
    /// one last non-blocking look.
    pub async fn wait_and_timeout_retry_clear(&self, timeout: u32) -> Result<LockResultCommand> {
        match self.wait(timeout).await {
            Err(e) if e.is_timeout() => {
                self.clear().await?;
                match self.wait(0).await {
                    Ok(result) => Ok(result),
                    Err(retry) if retry.is_locked() || retry.is_timeout() => Err(e),
                    Err(retry) => Err(retry),
                }
            }
            outcome => outcome,
        }
    }
}
