//! Callback worker pool and per-second timeout wheel
//!
//! Callback-style commands are parked as [`Deferred`] entries in two places:
//! the session's pending table and a [`TimeoutWheel`] bucket. Completion and
//! timeout race to take the callback out of the entry; the loser finds it
//! empty and does nothing, so every callback runs exactly once and always on
//! the [`CallbackExecutor`] pool rather than on the connection's read task.

use crate::error::{ClientError, Result};
use crate::pending::PendingTable;
use latchkey_protocol::{CommandResult, Ident};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// User callback for a command sent without awaiting.
pub type Callback = Box<dyn FnOnce(Result<CommandResult>) + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of named OS threads running callbacks.
///
/// Workers exit once every handle to the pool is dropped.
#[derive(Clone)]
pub struct CallbackExecutor {
    jobs: flume::Sender<Job>,
}

impl CallbackExecutor {
    pub fn new(workers: usize) -> Self {
        let (jobs, queue) = flume::unbounded::<Job>();
        for n in 0..workers.max(1) {
            let queue = queue.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("latchkey-callback-{}", n))
                .spawn(move || {
                    while let Ok(job) = queue.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("lock callback panicked");
                        }
                    }
                });
            if let Err(e) = spawned {
                error!("failed to start callback worker {}: {}", n, e);
            }
        }
        Self { jobs }
    }

    /// Runs `callback` with `outcome` on a worker thread.
    pub fn submit(&self, callback: Callback, outcome: Result<CommandResult>) {
        let job: Job = Box::new(move || callback(outcome));
        if let Err(flume::SendError(job)) = self.jobs.send(job) {
            // No worker left; run inline rather than lose the outcome
            job();
        }
    }
}

/// A callback-style command waiting for its result or its deadline.
pub struct Deferred {
    request_id: Ident,
    deadline: u64,
    wait: Duration,
    callback: Mutex<Option<Callback>>,
    table: Weak<PendingTable>,
    wheel: Weak<TimeoutWheel>,
    executor: CallbackExecutor,
}

impl Deferred {
    pub fn request_id(&self) -> Ident {
        self.request_id
    }

    /// Second at which the wheel fails this entry.
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    fn take_callback(&self) -> Option<Callback> {
        self.callback.lock().take()
    }

    /// Delivers a result or error unless the timeout got there first.
    pub(crate) fn complete(&self, outcome: Result<CommandResult>) {
        let Some(callback) = self.take_callback() else {
            return;
        };
        if let Some(wheel) = self.wheel.upgrade() {
            wheel.remove(self.deadline, &self.request_id);
        }
        self.executor.submit(callback, outcome);
    }

    /// Fails the entry with a timeout unless it already completed.
    fn expire(&self) -> bool {
        let Some(callback) = self.take_callback() else {
            return false;
        };
        if let Some(table) = self.table.upgrade() {
            table.take(&self.request_id);
        }
        debug!(request_id = %self.request_id, "callback command timed out");
        self.executor.submit(callback, Err(ClientError::Timeout(self.wait)));
        true
    }

    pub fn is_finished(&self) -> bool {
        self.callback.lock().is_none()
    }
}

/// Deadline-second buckets behind a cursor that only moves forward.
pub struct TimeoutWheel {
    origin: Instant,
    buckets: Mutex<BTreeMap<u64, HashMap<Ident, Arc<Deferred>>>>,
}

impl TimeoutWheel {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Whole seconds since the wheel was created.
    pub fn now_second(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }

    /// Deadline for a wait starting now: one full second past the rounded-up
    /// wait, so the entry can never fire early.
    pub fn deadline_for(&self, wait: Duration) -> u64 {
        let whole = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        self.now_second() + whole + 1
    }

    fn insert(&self, deferred: Arc<Deferred>) {
        self.buckets
            .lock()
            .entry(deferred.deadline)
            .or_default()
            .insert(deferred.request_id, deferred);
    }

    fn remove(&self, deadline: u64, request_id: &Ident) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(&deadline) {
            bucket.remove(request_id);
            if bucket.is_empty() {
                buckets.remove(&deadline);
            }
        }
    }

    /// Pops every bucket at or before `second`.
    fn pop_due(&self, second: u64) -> Vec<Arc<Deferred>> {
        let mut buckets = self.buckets.lock();
        let later = buckets.split_off(&(second + 1));
        let due = std::mem::replace(&mut *buckets, later);
        due.into_values().flat_map(HashMap::into_values).collect()
    }

    /// Fails every unfinished entry due at or before `second`; returns how
    /// many timed out.
    pub fn expire_due(&self, second: u64) -> usize {
        self.pop_due(second)
            .into_iter()
            .filter(|deferred| deferred.expire())
            .count()
    }

    /// One tick of the wheel at the current second.
    pub fn advance(&self) -> usize {
        self.expire_due(self.now_second())
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimeoutWheel {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool plus a wheel ticking once per second on the tokio runtime.
pub struct Scheduler {
    executor: CallbackExecutor,
    wheel: Arc<TimeoutWheel>,
    shutdown: CancellationToken,
}

impl Scheduler {
    /// Starts the ticker; must be called within a tokio runtime.
    pub fn start(workers: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            executor: CallbackExecutor::new(workers),
            wheel: Arc::new(TimeoutWheel::new()),
            shutdown: CancellationToken::new(),
        });

        let wheel = scheduler.wheel.clone();
        let shutdown = scheduler.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = wheel.advance();
                        if expired > 0 {
                            debug!(expired, "timeout wheel advanced");
                        }
                    }
                }
            }
        });

        scheduler
    }

    /// Parks `callback` until the result arrives or `wait` has elapsed.
    pub(crate) fn defer(
        &self,
        request_id: Ident,
        wait: Duration,
        table: &Arc<PendingTable>,
        callback: Callback,
    ) -> Arc<Deferred> {
        let deferred = Arc::new(Deferred {
            request_id,
            deadline: self.wheel.deadline_for(wait),
            wait,
            callback: Mutex::new(Some(callback)),
            table: Arc::downgrade(table),
            wheel: Arc::downgrade(&self.wheel),
            executor: self.executor.clone(),
        });
        self.wheel.insert(deferred.clone());
        deferred
    }

    /// Runs a callback that never reached the wire.
    pub fn dispatch(&self, callback: Callback, outcome: Result<CommandResult>) {
        self.executor.submit(callback, outcome);
    }

    pub fn wheel(&self) -> &Arc<TimeoutWheel> {
        &self.wheel
    }

    pub fn executor(&self) -> &CallbackExecutor {
        &self.executor
    }

    /// Stops the ticker. Entries still parked are left to their completions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::Pending;
    use latchkey_protocol::{codes, PingResultCommand};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn pong(request_id: Ident) -> CommandResult {
        CommandResult::Ping(PingResultCommand {
            request_id,
            result: codes::SUCCESS,
        })
    }

    fn parts() -> (Arc<TimeoutWheel>, CallbackExecutor, Arc<PendingTable>) {
        (
            Arc::new(TimeoutWheel::new()),
            CallbackExecutor::new(2),
            Arc::new(PendingTable::new()),
        )
    }

    fn deferred(
        wheel: &Arc<TimeoutWheel>,
        executor: &CallbackExecutor,
        table: &Arc<PendingTable>,
        id: Ident,
        wait: Duration,
        tx: mpsc::Sender<Result<CommandResult>>,
    ) -> Arc<Deferred> {
        let entry = Arc::new(Deferred {
            request_id: id,
            deadline: wheel.deadline_for(wait),
            wait,
            callback: Mutex::new(Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }))),
            table: Arc::downgrade(table),
            wheel: Arc::downgrade(wheel),
            executor: executor.clone(),
        });
        wheel.insert(entry.clone());
        assert!(table.register(id, Pending::Deferred(entry.clone())).is_ok());
        entry
    }

    #[test]
    fn deadline_is_strictly_after_the_rounded_wait() {
        let wheel = TimeoutWheel::new();
        let now = wheel.now_second();
        assert_eq!(wheel.deadline_for(Duration::ZERO), now + 1);
        assert_eq!(wheel.deadline_for(Duration::from_millis(1)), now + 2);
        assert_eq!(wheel.deadline_for(Duration::from_secs(5)), now + 6);
    }

    #[test]
    fn timeout_never_fires_before_its_second() {
        let (wheel, executor, table) = parts();
        let (tx, rx) = mpsc::channel();
        let id = Ident::from_u64_pair(1, 0);
        let entry = deferred(&wheel, &executor, &table, id, Duration::from_secs(3), tx);

        assert_eq!(wheel.expire_due(entry.deadline() - 1), 0);
        assert!(!entry.is_finished());

        assert_eq!(wheel.expire_due(entry.deadline()), 1);
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Err(ClientError::Timeout(_))));
        assert!(table.take(&id).is_none());
        assert!(wheel.is_empty());
    }

    #[test]
    fn completion_wins_over_a_later_timeout() {
        let (wheel, executor, table) = parts();
        let (tx, rx) = mpsc::channel();
        let id = Ident::from_u64_pair(2, 0);
        let entry = deferred(&wheel, &executor, &table, id, Duration::ZERO, tx);

        table.take(&id).unwrap().resolve(Ok(pong(id)));
        assert!(wheel.is_empty());
        assert_eq!(wheel.expire_due(entry.deadline() + 10), 0);

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.unwrap(), pong(id));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn timeout_then_late_completion_delivers_once() {
        let (wheel, executor, table) = parts();
        let (tx, rx) = mpsc::channel();
        let id = Ident::from_u64_pair(3, 0);
        let entry = deferred(&wheel, &executor, &table, id, Duration::ZERO, tx);

        assert_eq!(wheel.expire_due(entry.deadline()), 1);
        entry.complete(Ok(pong(id)));

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_err());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn racing_completion_and_timeout_deliver_exactly_once() {
        let (wheel, executor, table) = parts();
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut entries = Vec::new();
        for n in 0..200u64 {
            let (tx, _rx) = mpsc::channel();
            let id = Ident::from_u64_pair(n, 7);
            let entry = deferred(&wheel, &executor, &table, id, Duration::ZERO, tx);
            let counter = delivered.clone();
            *entry.callback.lock() = Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            entries.push(entry);
        }

        let deadline = entries[0].deadline() + 1;
        let ticker = {
            let wheel = wheel.clone();
            std::thread::spawn(move || wheel.expire_due(deadline))
        };
        for entry in &entries {
            if let Some(pending) = table.take(&entry.request_id()) {
                pending.resolve(Err(ClientError::ConnectionClosed));
            }
        }
        ticker.join().unwrap();

        let start = Instant::now();
        while delivered.load(Ordering::SeqCst) < entries.len()
            && start.elapsed() < Duration::from_secs(5)
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(delivered.load(Ordering::SeqCst), entries.len());
    }

    #[test]
    fn panicking_callback_does_not_kill_the_pool() {
        let executor = CallbackExecutor::new(1);
        let (tx, rx) = mpsc::channel();
        executor.submit(Box::new(|_| panic!("boom")), Err(ClientError::Unconnected));
        executor.submit(
            Box::new(move |outcome| {
                let _ = tx.send(outcome.is_err());
            }),
            Err(ClientError::Unconnected),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[tokio::test]
    async fn scheduler_ticker_expires_parked_entries() {
        let scheduler = Scheduler::start(2);
        let table = Arc::new(PendingTable::new());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = Ident::from_u64_pair(9, 9);
        let entry = scheduler.defer(
            id,
            Duration::ZERO,
            &table,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        assert!(table.register(id, Pending::Deferred(entry)).is_ok());

        let outcome = tokio::time::timeout(Duration::from_secs(4), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.unwrap_err().is_timeout());
        assert_eq!(table.len(), 0);
        scheduler.shutdown();
    }
}
