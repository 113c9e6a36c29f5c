use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::list::{TimerList, NIL};
use crate::timer::TimerInner;

/// Sentinel expiration for a bucket that is not enqueued anywhere.
pub(crate) const UNARMED: i64 = -1;

/// One slot of one wheel level: the timers sharing an expiration window.
///
/// The expiration is the absolute deadline this bucket next fires at. It is
/// swapped atomically on every add; a changed value means the bucket entered
/// a new arming cycle and must be (re)offered to the delay queue, while an
/// unchanged value suppresses duplicate queue entries within one cycle.
pub(crate) struct Bucket {
    expiration: AtomicI64,
    timers: Mutex<TimerList<Arc<TimerInner>>>,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            expiration: AtomicI64::new(UNARMED),
            timers: Mutex::new(TimerList::new()),
        }
    }

    #[inline]
    pub fn expiration(&self) -> i64 {
        self.expiration.load(Ordering::SeqCst)
    }

    /// Enlist `timer` with the bucket's canonical deadline.
    ///
    /// Returns `true` if the deadline changed, i.e. the bucket was freshly
    /// armed for a new cycle and the caller must offer it to the delay queue.
    pub fn add(bucket: &Arc<Bucket>, timer: &Arc<TimerInner>, expiration: i64) -> bool {
        let mut list = bucket.timers.lock();
        let key = list.push_back(Arc::clone(timer));
        timer.set_node_key(key);
        timer.set_bucket(bucket);
        bucket.expiration.swap(expiration, Ordering::SeqCst) != expiration
    }

    /// Unlink `timer` if this bucket still owns it.
    ///
    /// Returns `false` when the timer's back-pointer no longer names this
    /// bucket — the driver drained it concurrently (and possibly re-added it
    /// elsewhere); the caller re-reads the back-pointer and retries there.
    pub fn remove(&self, timer: &Arc<TimerInner>) -> bool {
        let mut list = self.timers.lock();
        match timer.bucket() {
            Some(owner) if ptr::eq(Arc::as_ptr(&owner), self) => {
                let key = timer.node_key();
                if list.remove(key).is_none() {
                    return false;
                }
                timer.clear_bucket();
                timer.set_node_key(NIL);
                true
            }
            _ => false,
        }
    }

    /// Detach every timer and disarm the bucket, then feed each timer to
    /// `reinsert`.
    ///
    /// The callback runs after the bucket's mutex is released: reinsertion
    /// takes other buckets' mutexes at this level and the wheel read lock,
    /// both of which may already be contended by the caller's context.
    pub fn flush(&self, mut reinsert: impl FnMut(Arc<TimerInner>)) {
        let drained = {
            let mut list = self.timers.lock();
            let mut drained = Vec::with_capacity(list.len());
            while let Some(timer) = list.pop_front() {
                timer.clear_bucket();
                timer.set_node_key(NIL);
                drained.push(timer);
            }
            self.expiration.swap(UNARMED, Ordering::SeqCst);
            drained
        };

        for timer in drained {
            reinsert(timer);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }
}
