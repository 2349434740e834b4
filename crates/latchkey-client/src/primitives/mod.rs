//! Concurrency primitives composed from [`Lock`](crate::Lock)
//!
//! Each primitive is a particular choice of key, id, count, rCount and flags
//! over the same acquire/release RPC, plus a little local state.

mod event;
mod flow;
mod group_event;
mod priority;
mod reentrant;
mod rwlock;
mod semaphore;
mod tree;

pub use event::Event;
pub use flow::{window_expire, MaxConcurrentFlow, TokenBucketFlow, WindowExpire};
pub use group_event::GroupEvent;
pub use priority::PriorityLock;
pub use reentrant::ReentrantLock;
pub use rwlock::ReadWriteLock;
pub use semaphore::Semaphore;
pub use tree::{TreeLeafLock, TreeLock};

/// `rCount` that lets one id re-enter a lock up to 255 extra times.
pub const REENTRANT_R_COUNT: u8 = 0xff;

/// `count` meaning "no practical limit on concurrent holders".
pub const UNBOUNDED_COUNT: u16 = 0xffff;
