//! Hierarchical locks
//!
//! A tree node is a key plus its parent's key. Holding a leaf on a node
//! excludes every ancestor and descendant node. The server learns the
//! parent/child links from two "check" marks placed before each non-root
//! leaf acquires its own lock.

use super::UNBOUNDED_COUNT;
use crate::database::Database;
use crate::error::{ClientError, Result};
use crate::lock::{tolerate, Lock};
use latchkey_protocol::{flags, LockKey, LockResultCommand};

/// A node in a lock tree. Cheap to clone.
#[derive(Clone, Debug)]
pub struct TreeLock {
    db: Database,
    key: LockKey,
    parent: Option<LockKey>,
    timeout: u32,
    expire: u32,
}

impl TreeLock {
    /// Root node for `key`.
    pub fn new(db: Database, key: LockKey, timeout: u32, expire: u32) -> Self {
        Self {
            db,
            key,
            parent: None,
            timeout,
            expire,
        }
    }

    /// Child node under this one.
    pub fn child(&self, key: impl AsRef<[u8]>) -> TreeLock {
        Self {
            db: self.db.clone(),
            key: LockKey::new(key),
            parent: Some(self.key),
            timeout: self.timeout,
            expire: self.expire,
        }
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn parent_key(&self) -> Option<LockKey> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// A holder slot on this node with its own lock id.
    pub fn new_leaf(&self) -> TreeLeafLock {
        TreeLeafLock {
            node: self.clone(),
            lock: Lock::new(
                self.db.clone(),
                self.key,
                self.db.next_id(),
                self.timeout,
                self.expire,
            ),
        }
    }

    /// Mark on the parent key recording this node as a child.
    fn child_check(&self, parent: LockKey) -> Lock {
        Lock::new(self.db.clone(), parent, self.key.as_ident(), 0, self.expire)
            .with_count(UNBOUNDED_COUNT)
    }

    /// Mark on this node's key recording its parent.
    fn parent_check(&self, parent: LockKey) -> Lock {
        Lock::new(self.db.clone(), self.key, parent.as_ident(), 0, self.expire)
    }
}

/// One holder of a [`TreeLock`] node.
pub struct TreeLeafLock {
    node: TreeLock,
    lock: Lock,
}

impl TreeLeafLock {
    pub fn node(&self) -> &TreeLock {
        &self.node
    }

    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Places the check marks, then takes the node exclusively.
    ///
    /// An already-present mark is not an error. Marks stay in place if the
    /// exclusive acquire fails.
    pub async fn acquire(&self) -> Result<LockResultCommand> {
        if let Some(parent) = self.node.parent {
            tolerate(
                self.node
                    .child_check(parent)
                    .acquire_with_flag(flags::lock::LOCK_TREE_LOCK)
                    .await,
                ClientError::is_locked,
            )?;
            tolerate(
                self.node
                    .parent_check(parent)
                    .acquire_with_flag(flags::lock::LOCK_TREE_LOCK)
                    .await,
                ClientError::is_locked,
            )?;
        }
        self.lock.acquire().await
    }

    /// Releases the node, then both check marks.
    pub async fn release(&self) -> Result<LockResultCommand> {
        let result = self.lock.release().await?;
        if let Some(parent) = self.node.parent {
            tolerate(
                self.node
                    .child_check(parent)
                    .release_with_flag(flags::unlock::UNLOCK_TREE_LOCK)
                    .await,
                ClientError::is_unlocked,
            )?;
            tolerate(
                self.node
                    .parent_check(parent)
                    .release_with_flag(flags::unlock::UNLOCK_TREE_LOCK)
                    .await,
                ClientError::is_unlocked,
            )?;
        }
        Ok(result)
    }
}
