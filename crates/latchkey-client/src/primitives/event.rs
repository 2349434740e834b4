//! Two-state event flag

use crate::database::Database;
use crate::error::{ClientError, Result};
use crate::lock::{tolerate, Lock};
use latchkey_protocol::{flags, LockKey, LockResultCommand};

/// A set/clear flag that waiters block on until it is set.
///
/// The flag is a lock on the event key held under the key's own bytes as
/// id. With `default_set` the event is set while nobody holds that lock and
/// clearing takes it; without, the roles swap and waiting uses a reverse
/// wait (until the key is held). Both polarities behave the same to callers.
#[derive(Clone, Debug)]
pub struct Event {
    db: Database,
    key: LockKey,
    timeout: u32,
    expire: u32,
    default_set: bool,
}

fn settle(outcome: Result<LockResultCommand>, benign: fn(&ClientError) -> bool) -> Result<()> {
    tolerate(outcome, benign).map(|_| ())
}

impl Event {
    pub fn new(db: Database, key: LockKey, timeout: u32, expire: u32, default_set: bool) -> Self {
        Self {
            db,
            key,
            timeout,
            expire,
            default_set,
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn default_set(&self) -> bool {
        self.default_set
    }

    /// The lock whose presence flips the event away from its default.
    fn marker(&self) -> Lock {
        Lock::new(
            self.db.clone(),
            self.key,
            self.key.as_ident(),
            self.timeout,
            self.expire,
        )
    }

    /// Zero-expire lock that succeeds once the event is set.
    fn peek(&self, timeout: u32) -> Lock {
        let timeout = if self.default_set {
            timeout
        } else {
            flags::with_modifiers(timeout, flags::timeout::REVERSE_KEY_LOCK_WAIT)
        };
        Lock::new(self.db.clone(), self.key, self.db.next_id(), timeout, 0)
    }

    pub async fn is_set(&self) -> Result<bool> {
        match self.peek(0).acquire().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_locked() || e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set(&self) -> Result<()> {
        if self.default_set {
            settle(self.marker().release().await, ClientError::is_unlocked)
        } else {
            settle(self.marker().update().await, ClientError::is_locked)
        }
    }

    pub async fn clear(&self) -> Result<()> {
        if self.default_set {
            settle(self.marker().update().await, ClientError::is_locked)
        } else {
            settle(self.marker().release().await, ClientError::is_unlocked)
        }
    }

    /// Waits up to `timeout` (a packed wire word) for the event to be set.
    pub async fn wait(&self, timeout: u32) -> Result<()> {
        self.peek(timeout).acquire().await.map(|_| ())
    }

    /// Like [`wait`](Self::wait), but on timeout clears the event and takes
    /// one last non-blocking look before giving up.
    pub async fn wait_and_timeout_retry_clear(&self, timeout: u32) -> Result<()> {
        match self.wait(timeout).await {
            Err(e) if e.is_timeout() => {
                self.clear().await?;
                match self.wait(0).await {
                    Ok(()) => Ok(()),
                    Err(retry) if retry.is_locked() || retry.is_timeout() => Err(e),
                    Err(retry) => Err(retry),
                }
            }
            outcome => outcome,
        }
    }

    pub fn set_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if self.default_set {
            self.marker().release_with_callback(0, move |outcome| {
                callback(settle(outcome, ClientError::is_unlocked))
            });
        } else {
            self.marker()
                .acquire_with_callback(flags::lock::UPDATE_WHEN_LOCKED, move |outcome| {
                    callback(settle(outcome, ClientError::is_locked))
                });
        }
    }

    pub fn clear_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if self.default_set {
            self.marker()
                .acquire_with_callback(flags::lock::UPDATE_WHEN_LOCKED, move |outcome| {
                    callback(settle(outcome, ClientError::is_locked))
                });
        } else {
            self.marker().release_with_callback(0, move |outcome| {
                callback(settle(outcome, ClientError::is_unlocked))
            });
        }
    }

    pub fn wait_with_callback<F>(&self, timeout: u32, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.peek(timeout)
            .acquire_with_callback(0, move |outcome| callback(outcome.map(|_| ())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::scripted;
    use latchkey_protocol::{codes, CommandType};

    #[tokio::test]
    async fn default_set_clears_by_taking_the_marker() {
        let (db, sender) = scripted::database(|command| (codes::LOCKED_ERROR, command.lock_id));
        let event = Event::new(db, LockKey::new("ev"), 5, 30, true);
        event.clear().await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent[0].command_type, CommandType::Lock);
        assert_eq!(sent[0].flag, flags::lock::UPDATE_WHEN_LOCKED);
        assert_eq!(sent[0].lock_id, LockKey::new("ev").as_ident());
    }

    #[tokio::test]
    async fn default_unset_waits_in_reverse() {
        let (db, sender) = scripted::database(|command| (codes::SUCCESS, command.lock_id));
        let event = Event::new(db, LockKey::new("ev"), 5, 30, false);
        event.wait(7).await.unwrap();

        let peek = sender.sent()[0];
        assert_eq!(flags::value(peek.timeout), 7);
        assert_eq!(
            flags::modifiers(peek.timeout),
            flags::timeout::REVERSE_KEY_LOCK_WAIT
        );
        assert_eq!(peek.expire, 0);
        assert_ne!(peek.lock_id, LockKey::new("ev").as_ident());
    }

    #[tokio::test]
    async fn set_suppresses_already_set_on_both_paths() {
        let (db, _) = scripted::database(|command| (codes::UNLOCK_ERROR, command.lock_id));
        let event = Event::new(db, LockKey::new("ev"), 5, 30, true);
        event.set().await.unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        event.set_with_callback(move |outcome| {
            let _ = tx.send(outcome.is_ok());
        });
        assert!(rx.recv().unwrap());
    }

    #[tokio::test]
    async fn is_set_maps_locked_to_false() {
        let (db, _) = scripted::database(|command| (codes::LOCKED_ERROR, command.lock_id));
        let event = Event::new(db, LockKey::new("ev"), 5, 30, true);
        assert!(!event.is_set().await.unwrap());
    }
}
