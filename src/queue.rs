use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

struct Entry<T> {
    expiration: i64,
    item: T,
}

// Reversed comparison so the BinaryHeap max-heap yields the smallest
// deadline first. Entries with equal deadlines are unordered.
impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expiration == other.expiration
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.expiration.cmp(&self.expiration)
    }
}

/// Priority queue of deadline-keyed items with a blocking single consumer.
///
/// Producers `offer` items from any thread; one poller thread runs `poll`,
/// sleeping exactly until the head deadline is due and delivering due items
/// over a rendezvous channel. Offering a deadline earlier than the current
/// head interrupts the poller's sleep so it can re-evaluate.
pub(crate) struct DelayQueue<T> {
    heap: Mutex<BinaryHeap<Entry<T>>>,
    available: Condvar,
    tx: Sender<T>,
}

impl<T: Send + 'static> DelayQueue<T> {
    /// Create a queue and the consumer end of its delivery channel.
    pub fn with_capacity(capacity: usize) -> (Self, Receiver<T>) {
        let (tx, rx) = bounded(0);
        let queue = Self {
            heap: Mutex::new(BinaryHeap::with_capacity(capacity)),
            available: Condvar::new(),
            tx,
        };
        (queue, rx)
    }

    /// Insert `item` to be delivered at `expiration_ms`.
    pub fn offer(&self, item: T, expiration_ms: i64) {
        let mut heap = self.heap.lock();
        let new_head = heap
            .peek()
            .map_or(true, |head| expiration_ms < head.expiration);
        heap.push(Entry {
            expiration: expiration_ms,
            item,
        });
        if new_head {
            self.available.notify_one();
        }
    }

    /// Deliver items as they come due, until `exit` is set.
    ///
    /// `now_fn` supplies the current time in the same millisecond domain as
    /// the offered deadlines. Returns when `exit` is observed (after `wake`)
    /// or when the consumer end of the delivery channel is gone.
    pub fn poll(&self, exit: &AtomicBool, now_fn: impl Fn() -> i64) {
        loop {
            let mut heap = self.heap.lock();
            // Checked under the lock: `wake` also takes it, so an exit
            // signal cannot slip between this check and the wait below.
            if exit.load(Ordering::SeqCst) {
                return;
            }
            match heap.peek().map(|head| head.expiration) {
                None => {
                    self.available.wait(&mut heap);
                }
                Some(expiration) => {
                    let delay = expiration - now_fn();
                    if delay > 0 {
                        // Woken early by an earlier offer or a shutdown;
                        // either way the next iteration re-evaluates.
                        let _ = self
                            .available
                            .wait_for(&mut heap, Duration::from_millis(delay as u64));
                        continue;
                    }
                    let Some(entry) = heap.pop() else { continue };
                    drop(heap);
                    if self.tx.send(entry.item).is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Interrupt the poller so it re-checks `exit`.
    pub fn wake(&self) {
        let _heap = self.heap.lock();
        self.available.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Pop the head if it is due at `now_ms`. Drives wheel tests without a
    /// poller thread.
    #[cfg(test)]
    pub fn pop_ready(&self, now_ms: i64) -> Option<T> {
        let mut heap = self.heap.lock();
        if heap.peek().map_or(false, |head| head.expiration <= now_ms) {
            heap.pop().map(|entry| entry.item)
        } else {
            None
        }
    }
}
