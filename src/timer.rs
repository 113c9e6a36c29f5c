use std::any::Any;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapWeak;
use tracing::trace;

use crate::bucket::Bucket;
use crate::executor::Executor;
use crate::list::NIL;

/// Opaque payload forwarded to a timer's callback.
pub type TaskArgs = Arc<dyn Any + Send + Sync>;

/// The stored form of a timer's callback: task id plus optional payload.
pub(crate) type TaskFn = Arc<dyn Fn(&str, Option<&TaskArgs>) + Send + Sync>;

/// Shared state of a single scheduled event.
///
/// Enlisted in at most one bucket at a time. The bucket back-pointer is a
/// weak reference swapped lock-free: `Bucket::add` points it here,
/// `Bucket::remove` and `Bucket::flush` clear it, and `Timer::stop` races
/// against both by re-reading it until it goes empty.
pub(crate) struct TimerInner {
    expiration: AtomicI64,
    pub(crate) task: TaskFn,
    pub(crate) task_id: String,
    pub(crate) task_args: Option<TaskArgs>,
    bucket: ArcSwapWeak<Bucket>,
    node: AtomicUsize,
}

impl TimerInner {
    pub fn new(
        expiration: i64,
        task: TaskFn,
        task_id: String,
        task_args: Option<TaskArgs>,
    ) -> Self {
        Self {
            expiration: AtomicI64::new(expiration),
            task,
            task_id,
            task_args,
            bucket: ArcSwapWeak::new(Weak::new()),
            node: AtomicUsize::new(NIL),
        }
    }

    #[inline]
    pub fn expiration(&self) -> i64 {
        self.expiration.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_expiration(&self, expiration_ms: i64) {
        self.expiration.store(expiration_ms, Ordering::SeqCst);
    }

    pub fn bucket(&self) -> Option<Arc<Bucket>> {
        self.bucket.load().upgrade()
    }

    /// Record the owning bucket. Called under that bucket's mutex.
    pub fn set_bucket(&self, bucket: &Arc<Bucket>) {
        self.bucket.store(Arc::downgrade(bucket));
    }

    /// Detach from the owning bucket. Called under that bucket's mutex.
    pub fn clear_bucket(&self) {
        self.bucket.store(Weak::new());
    }

    #[inline]
    pub fn node_key(&self) -> usize {
        self.node.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_node_key(&self, key: usize) {
        self.node.store(key, Ordering::SeqCst);
    }

    /// Hand the task to the executor. Non-blocking.
    pub fn dispatch(self: Arc<Self>, executor: &dyn Executor) {
        executor.spawn(Box::new(move || {
            (self.task)(&self.task_id, self.task_args.as_ref());
        }));
    }
}

/// Handle to a scheduled event, returned by the scheduling APIs.
///
/// Cloning yields another handle to the same event; dropping all handles does
/// not cancel it.
#[derive(Clone)]
pub struct Timer {
    pub(crate) inner: Arc<TimerInner>,
}

impl Timer {
    /// Prevents the timer from firing if possible.
    ///
    /// Returns `true` if this call removed the timer from an armed bucket,
    /// `false` if the timer already fired, was already stopped, or was never
    /// armed. A `true` return guarantees the task will not run; a `false`
    /// return from a timer that already fired does not wait for the task to
    /// complete.
    pub fn stop(&self) -> bool {
        let mut stopped = false;
        // The driver may concurrently move this timer from one bucket to
        // another (flush drains it, the reinsert callback re-adds it). Each
        // failed removal re-reads the back-pointer; the loop ends once it is
        // empty, meaning either we unlinked the timer or it was released.
        while let Some(bucket) = self.inner.bucket() {
            stopped = bucket.remove(&self.inner);
        }
        trace!(task_id = %self.inner.task_id, stopped, "timer stop");
        stopped
    }

    /// The task id this timer fires under.
    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    /// Absolute deadline in UTC milliseconds.
    pub fn expiration_ms(&self) -> i64 {
        self.inner.expiration()
    }
}
