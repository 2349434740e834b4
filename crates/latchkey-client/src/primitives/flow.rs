//! Concurrency and rate limiters

use crate::database::Database;
use crate::error::{ClientError, LockErrorKind, Result};
use crate::lock::Lock;
use latchkey_protocol::{flags, LockKey, LockResultCommand};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Caps how many holders run at once on a key.
///
/// Unlike [`Semaphore`](super::Semaphore), release hands back this handle's
/// own id, so each handle frees only what it took.
pub struct MaxConcurrentFlow {
    db: Database,
    key: LockKey,
    permits: u16,
    timeout: u32,
    expire: u32,
    priority: Option<u8>,
    lock: Mutex<Option<Lock>>,
}

impl MaxConcurrentFlow {
    pub fn new(db: Database, key: LockKey, permits: u16, timeout: u32, expire: u32) -> Self {
        Self {
            db,
            key,
            permits: permits.max(1),
            timeout,
            expire,
            priority: None,
            lock: Mutex::new(None),
        }
    }

    /// Queue ahead of lower-priority waiters.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn permits(&self) -> u16 {
        self.permits
    }

    fn current(&self) -> Lock {
        self.lock
            .lock()
            .get_or_insert_with(|| {
                let lock = Lock::new(
                    self.db.clone(),
                    self.key,
                    self.db.next_id(),
                    self.timeout,
                    self.expire,
                )
                .with_count(self.permits - 1);
                match self.priority {
                    Some(priority) => lock
                        .with_timeout(flags::with_modifiers(
                            self.timeout,
                            flags::timeout::RCOUNT_IS_PRIORITY,
                        ))
                        .with_r_count(priority),
                    None => lock,
                }
            })
            .clone()
    }

    pub async fn acquire(&self) -> Result<LockResultCommand> {
        self.current().acquire().await
    }

    pub async fn release(&self) -> Result<LockResultCommand> {
        let lock = self.lock.lock().clone().ok_or_else(ClientError::not_held)?;
        lock.release().await
    }

    pub fn acquire_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.current().acquire_with_callback(0, callback);
    }

    pub fn release_with_callback<F>(&self, callback: F)
    where
        F: FnOnce(Result<LockResultCommand>) + Send + 'static,
    {
        self.current().release_with_callback(0, callback);
    }
}

/// Expire word for a token-bucket slot and the window end it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowExpire {
    /// Unix milliseconds at which the current window closes
    pub boundary_ms: u64,
    /// Packed expire word counting down to `boundary_ms`
    pub expire: u32,
}

/// Longest window an expire word can express: `u16::MAX` minutes.
const MAX_WINDOW_MS: u64 = u16::MAX as u64 * 60_000;

/// Window length in milliseconds, clamped to what the wire can carry.
fn window_len_ms(period: f64) -> u64 {
    ((period * 1000.0).round() as u64).clamp(1, MAX_WINDOW_MS)
}

fn seconds_expire(secs: u64) -> u32 {
    match u16::try_from(secs) {
        Ok(secs) => flags::pack(secs, 0),
        Err(_) => flags::pack(
            u16::try_from(secs.div_ceil(60)).unwrap_or(u16::MAX),
            flags::expire::MINUTE_TIME,
        ),
    }
}

/// Aligns a slot's expiry to the end of the rate window containing `now_ms`.
///
/// Sub-second periods count in milliseconds within the current second.
/// Longer periods align to the next multiple of the period in milliseconds,
/// so whole minutes end on minute boundaries and 1.5 s windows stay 1.5 s.
pub fn window_expire(period: f64, now_ms: u64) -> WindowExpire {
    let window_ms = window_len_ms(period);
    if window_ms < 1000 {
        let second = now_ms - now_ms % 1000;
        let boundary_ms =
            (second + (now_ms % 1000 / window_ms + 1) * window_ms).min(second + 1000);
        return WindowExpire {
            boundary_ms,
            expire: flags::pack(
                (boundary_ms - now_ms) as u16,
                flags::expire::MILLISECOND_TIME,
            ),
        };
    }

    // Unix time starts on a minute, so multiples of 60 s end on minute boundaries
    let boundary_ms = (now_ms / window_ms + 1) * window_ms;
    WindowExpire {
        boundary_ms,
        expire: seconds_expire((boundary_ms - now_ms).div_ceil(1000)),
    }
}

/// Expire word for the raw period, used when the aligned attempt timed out.
fn period_expire(period: f64) -> u32 {
    let window_ms = window_len_ms(period);
    if window_ms < 1000 {
        flags::pack(window_ms as u16, flags::expire::MILLISECOND_TIME)
    } else {
        seconds_expire(window_ms.div_ceil(1000))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Admits `permits` acquisitions per window of `period` seconds.
///
/// Slots are never released; they expire when their window closes.
#[derive(Clone)]
pub struct TokenBucketFlow {
    db: Database,
    key: LockKey,
    permits: u16,
    timeout: u32,
    period: f64,
}

impl TokenBucketFlow {
    /// Fails with [`ClientError::Config`] unless `period` is a positive
    /// finite number of seconds.
    pub fn new(
        db: Database,
        key: LockKey,
        permits: u16,
        timeout: u32,
        period: f64,
    ) -> Result<Self> {
        if !(period.is_finite() && period > 0.0) {
            return Err(ClientError::Config(format!(
                "token bucket period must be a positive number of seconds, got {}",
                period
            )));
        }
        Ok(Self {
            db,
            key,
            permits: permits.max(1),
            timeout,
            period,
        })
    }

    pub fn key(&self) -> LockKey {
        self.key
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    /// Window the next acquire would target.
    pub fn current_window(&self) -> WindowExpire {
        window_expire(self.period, unix_millis())
    }

    fn slot(&self, expire: u32) -> Lock {
        Lock::new(
            self.db.clone(),
            self.key,
            self.db.next_id(),
            self.timeout,
            expire,
        )
        .with_count(self.permits - 1)
    }

    pub async fn acquire(&self) -> Result<LockResultCommand> {
        let window = self.current_window();
        match self.slot(window.expire).acquire().await {
            Err(e) if e.lock_kind() == Some(LockErrorKind::Timeout) => {
                self.slot(period_expire(self.period)).acquire().await
            }
            outcome => outcome,
        }
    }
}
