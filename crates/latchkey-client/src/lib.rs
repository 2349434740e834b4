//! Client runtime for the latchkey distributed lock service
//!
//! A [`Client`] keeps one self-healing TCP connection per configured server
//! (or a replica set routed to the first live one) and multiplexes every
//! lock command over it. Commands are either awaited or handed a callback
//! that runs exactly once on a worker pool, with a one-second timeout wheel
//! as the backstop.
//!
//! ```ignore
//! let client = Client::connect_single("127.0.0.1:5658").await?;
//! let db = client.database(0);
//!
//! let lock = db.lock("test1", 5, 5);
//! lock.acquire().await?;
//! lock.release().await?;
//!
//! let permits = db.semaphore("workers", 4, 5, 30);
//! permits.acquire().await?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod lock;
mod pending;
pub mod primitives;
pub mod replset;
pub mod scheduler;

pub use client::{Client, CommandSender};
pub use config::{parse_host, ClientConfig};
pub use connection::{Connection, ConnectionSettings, ConnectionState, LivenessListener};
pub use database::Database;
pub use error::{ClientError, LockErrorKind, Result};
pub use lock::Lock;
pub use primitives::{
    Event, GroupEvent, MaxConcurrentFlow, PriorityLock, ReadWriteLock, ReentrantLock, Semaphore,
    TokenBucketFlow, TreeLeafLock, TreeLock,
};
pub use replset::ReplicaSet;
pub use scheduler::{Callback, CallbackExecutor, Deferred, Scheduler, TimeoutWheel};

pub use latchkey_protocol as protocol;
