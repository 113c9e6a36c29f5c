use std::thread;

use tracing::warn;

/// A boxed task handed to the executor when a timer fires.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs fired timer tasks off the driver thread.
///
/// `spawn` must not block the caller: the dispatcher invokes it while it is
/// the only thread draining expired buckets, so a slow or panicking task must
/// land somewhere else. Panics inside a task are the executor's problem and
/// must not reach the driver.
pub trait Executor: Send + Sync {
    fn spawn(&self, task: Task);
}

/// Default executor: one short-lived thread per fired task.
///
/// This mirrors firing each callback on a fresh goroutine. Workloads with
/// very high fire rates can plug in a pooled implementation instead.
#[derive(Debug, Default)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn spawn(&self, task: Task) {
        let spawned = thread::Builder::new()
            .name("tickwheel-task".into())
            .spawn(task);
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn task thread; task dropped");
        }
    }
}
