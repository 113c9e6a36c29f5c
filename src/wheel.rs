use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::trace;

use crate::bucket::Bucket;
use crate::clock::truncate;
use crate::queue::DelayQueue;
use crate::timer::TimerInner;

/// One level of the hierarchy: a ring of buckets with a shared tick.
///
/// Level k's tick equals level k-1's whole span, so each level covers
/// `wheel_size` times more time than the one before it. Coarser levels are
/// created lazily on the first insertion that overflows this level's span
/// and are never torn down; the chain is unbounded, but its length grows
/// logarithmically in the deadline horizon. Every level shares the same
/// delay queue.
pub(crate) struct Wheel {
    tick: i64,
    wheel_size: i64,
    interval: i64,
    current_time: AtomicI64,
    buckets: Box<[Arc<Bucket>]>,
    queue: Arc<DelayQueue<Arc<Bucket>>>,
    overflow: ArcSwapOption<Wheel>,
}

impl Wheel {
    pub fn new(
        tick_ms: i64,
        wheel_size: i64,
        start_ms: i64,
        queue: Arc<DelayQueue<Arc<Bucket>>>,
    ) -> Self {
        let buckets = (0..wheel_size)
            .map(|_| Arc::new(Bucket::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            tick: tick_ms,
            wheel_size,
            interval: tick_ms * wheel_size,
            current_time: AtomicI64::new(truncate(start_ms, tick_ms)),
            buckets,
            queue,
            overflow: ArcSwapOption::from(None),
        }
    }

    /// Place `timer` into the hierarchy rooted at this level.
    ///
    /// Returns `false` if the deadline falls inside the current tick, i.e.
    /// the timer counts as already expired and the caller must run it.
    /// Callers hold the read side of the shared wheel lock, so the clock
    /// cannot advance mid-insertion.
    pub fn add(&self, timer: &Arc<TimerInner>) -> bool {
        let current = self.current_time.load(Ordering::SeqCst);
        let expiration = timer.expiration();
        if expiration < current + self.tick {
            false
        } else if expiration < current + self.interval {
            // Virtual id is stable across wheel revolutions; it picks both
            // the slot and the bucket's canonical deadline.
            let virtual_id = expiration / self.tick;
            let bucket = &self.buckets[(virtual_id % self.wheel_size) as usize];
            if Bucket::add(bucket, timer, virtual_id * self.tick) {
                trace!(
                    task_id = %timer.task_id,
                    expiration = bucket.expiration(),
                    tick = self.tick,
                    "bucket armed"
                );
                self.queue.offer(Arc::clone(bucket), bucket.expiration());
            }
            true
        } else {
            self.overflow().add(timer)
        }
    }

    /// The next (coarser) level, created on first use.
    fn overflow(&self) -> Arc<Wheel> {
        if let Some(wheel) = self.overflow.load_full() {
            return wheel;
        }
        let current = self.current_time.load(Ordering::SeqCst);
        let fresh = Arc::new(Wheel::new(
            self.interval,
            self.wheel_size,
            current,
            Arc::clone(&self.queue),
        ));
        // Concurrent inserters race to install; the loser adopts the winner.
        let prev = self
            .overflow
            .compare_and_swap(ptr::null::<Wheel>(), Some(Arc::clone(&fresh)));
        match &*prev {
            Some(existing) => Arc::clone(existing),
            None => fresh,
        }
    }

    /// Move this level's clock forward to cover `expiration_ms`.
    ///
    /// Only the dispatcher calls this, holding the write side of the shared
    /// wheel lock. Coarser levels advance recursively with the truncated
    /// time.
    pub fn advance_clock(&self, expiration_ms: i64) {
        let current = self.current_time.load(Ordering::SeqCst);
        if expiration_ms >= current + self.tick {
            let truncated = truncate(expiration_ms, self.tick);
            self.current_time.store(truncated, Ordering::SeqCst);
            if let Some(overflow) = self.overflow.load_full() {
                overflow.advance_clock(truncated);
            }
        }
    }

    #[inline]
    pub fn tick(&self) -> i64 {
        self.tick
    }

    #[cfg(test)]
    pub fn current_time(&self) -> i64 {
        self.current_time.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        1 + self
            .overflow
            .load()
            .as_ref()
            .map_or(0, |wheel| wheel.depth())
    }
}
