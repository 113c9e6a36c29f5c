use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Rounds `x` down to a multiple of `m`. Returns `x` unchanged if `m <= 0`.
#[inline]
pub(crate) fn truncate(x: i64, m: i64) -> i64 {
    if m <= 0 { x } else { x - x % m }
}

/// Millisecond time source for the wheel.
///
/// All values are UTC milliseconds since the Unix epoch. The driver only
/// compares and subtracts these values, so any source that is monotonically
/// nondecreasing works.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock time source used in production.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// Manually advanced time source for deterministic tests.
///
/// Time only moves when told to, and never backwards.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    /// Advances the clock by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Moves the clock to `target_ms` if that is in the future.
    pub fn advance_to(&self, target_ms: i64) {
        self.now.fetch_max(target_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
