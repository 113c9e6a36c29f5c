//! Hierarchical timing wheel for massive numbers of delayed tasks.
//!
//! Timers live in cascading buckets across wheel levels of geometrically
//! increasing granularity; a shared delay queue wakes the driver once per
//! expiring *bucket*, not per timer, so insert, cancel and fire are all
//! amortized O(1) regardless of how many timers are armed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use uuid::Uuid;

mod bucket;
mod clock;
mod executor;
mod list;
mod queue;
mod scheduler;
mod timer;
mod wheel;

pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{Executor, Task, ThreadExecutor};
pub use scheduler::{Every, Scheduler};
pub use timer::{TaskArgs, Timer};

use bucket::Bucket;
use queue::DelayQueue;
use timer::{TaskFn, TimerInner};
use wheel::Wheel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("tick must be at least one millisecond (got {0:?})")]
    TickTooSmall(Duration),
    #[error("wheel size must be positive (got {0})")]
    InvalidWheelSize(i64),
}

/// Configures a [`TimingWheel`] before construction.
pub struct Builder {
    tick: Duration,
    wheel_size: i64,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn Executor>,
}

impl Builder {
    /// Replace the wall clock, e.g. with [`ManualClock`] in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the thread-per-task executor with a custom one.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn build(self) -> Result<TimingWheel, Error> {
        let tick_ms = self.tick.as_millis() as i64;
        if tick_ms < 1 {
            return Err(Error::TickTooSmall(self.tick));
        }
        if self.wheel_size < 1 {
            return Err(Error::InvalidWheelSize(self.wheel_size));
        }

        let (queue, delivery_rx) = DelayQueue::with_capacity(self.wheel_size as usize);
        let queue = Arc::new(queue);
        let (exit_tx, exit_rx) = unbounded::<()>();
        let start_ms = self.clock.now_ms();

        Ok(TimingWheel {
            core: Arc::new(Core {
                wheel: Wheel::new(tick_ms, self.wheel_size, start_ms, Arc::clone(&queue)),
                queue,
                rw: RwLock::new(()),
                clock: self.clock,
                executor: self.executor,
                exit: AtomicBool::new(false),
                exit_tx: Mutex::new(Some(exit_tx)),
                exit_rx,
                delivery_rx: Mutex::new(Some(delivery_rx)),
                drivers: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct Core {
    /// Innermost level; coarser levels hang off it lazily.
    wheel: Wheel,
    queue: Arc<DelayQueue<Arc<Bucket>>>,
    /// Inserters hold the read side, the dispatcher holds the write side
    /// while advancing clocks, so no insertion straddles a clock edge.
    rw: RwLock<()>,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn Executor>,
    exit: AtomicBool,
    exit_tx: Mutex<Option<Sender<()>>>,
    exit_rx: Receiver<()>,
    delivery_rx: Mutex<Option<Receiver<Arc<Bucket>>>>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Insert the timer, or dispatch it right away if it is already due.
    fn add_or_run(&self, timer: Arc<TimerInner>) {
        let inserted = {
            let _read = self.rw.read();
            self.wheel.add(&timer)
        };
        if !inserted {
            trace!(task_id = %timer.task_id, "task due, dispatching");
            timer.dispatch(&*self.executor);
        }
    }
}

/// A hierarchical timing wheel.
///
/// Cloning yields another handle to the same wheel. Construct with
/// [`TimingWheel::new`] or [`TimingWheel::builder`], call [`start`] once to
/// launch the driver threads, schedule with the `after_func` / `schedule_func`
/// family, and [`stop`] to shut the drivers down.
///
/// [`start`]: TimingWheel::start
/// [`stop`]: TimingWheel::stop
#[derive(Clone)]
pub struct TimingWheel {
    core: Arc<Core>,
}

impl std::fmt::Debug for TimingWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingWheel").finish_non_exhaustive()
    }
}

impl TimingWheel {
    /// A wheel with the given innermost tick and slots per level, using the
    /// system clock and the thread-per-task executor.
    pub fn new(tick: Duration, wheel_size: i64) -> Result<Self, Error> {
        Self::builder(tick, wheel_size).build()
    }

    pub fn builder(tick: Duration, wheel_size: i64) -> Builder {
        Builder {
            tick,
            wheel_size,
            clock: Arc::new(SystemClock),
            executor: Arc::new(ThreadExecutor),
        }
    }

    /// Launch the two driver threads: the delay-queue poller and the
    /// dispatcher that advances the clocks and cascades expired buckets.
    ///
    /// Call once; a second call is a logged no-op.
    pub fn start(&self) {
        let Some(delivery) = self.core.delivery_rx.lock().take() else {
            warn!("timing wheel already started");
            return;
        };

        let core = Arc::clone(&self.core);
        let poller = thread::Builder::new()
            .name("tickwheel-poller".into())
            .spawn(move || {
                let clock = Arc::clone(&core.clock);
                core.queue.poll(&core.exit, || clock.now_ms());
            })
            .expect("failed to spawn poller thread");

        let core = Arc::clone(&self.core);
        let exit_rx = self.core.exit_rx.clone();
        let dispatcher = thread::Builder::new()
            .name("tickwheel-dispatcher".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(delivery) -> msg => match msg {
                            Ok(bucket) => {
                                {
                                    let _write = core.rw.write();
                                    core.wheel.advance_clock(bucket.expiration());
                                }
                                // Cascade: survivors re-enter at whichever
                                // level now matches their remaining delay;
                                // already-due timers run on the executor.
                                bucket.flush(|timer| core.add_or_run(timer));
                            }
                            Err(_) => break,
                        },
                        recv(exit_rx) -> _ => break,
                    }
                }
                debug!("dispatcher stopped");
            })
            .expect("failed to spawn dispatcher thread");

        self.core.drivers.lock().extend([poller, dispatcher]);
        debug!(tick_ms = self.core.wheel.tick(), "timing wheel started");
    }

    /// Signal the drivers to exit and wait for them.
    ///
    /// Tasks already handed to the executor are not awaited; timers still
    /// armed simply never fire.
    pub fn stop(&self) {
        self.core.exit.store(true, Ordering::SeqCst);
        self.core.queue.wake();
        self.core.exit_tx.lock().take();

        let drivers: Vec<_> = self.core.drivers.lock().drain(..).collect();
        for handle in drivers {
            if handle.join().is_err() {
                warn!("driver thread panicked during shutdown");
            }
        }
        debug!("timing wheel stopped");
    }

    /// Run `f` once after `delay`. Returns a [`Timer`] that can cancel it.
    pub fn after_func<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let now = self.core.clock.now_ms();
        let task_id = auto_task_id("auto_after_func", now);
        let task: TaskFn = Arc::new(move |id, _args| {
            trace!(task_id = id, "task fired");
            f();
        });
        self.spawn_timer(now + delay.as_millis() as i64, task, task_id, None)
    }

    /// Like [`after_func`], with a task id and an opaque payload forwarded to
    /// the callback. An empty `id` gets a generated one.
    ///
    /// [`after_func`]: TimingWheel::after_func
    pub fn after_func_with_args<F>(
        &self,
        delay: Duration,
        f: F,
        id: impl Into<String>,
        args: TaskArgs,
    ) -> Timer
    where
        F: Fn(&str, Option<&TaskArgs>) + Send + Sync + 'static,
    {
        let now = self.core.clock.now_ms();
        let mut task_id = id.into();
        if task_id.is_empty() {
            task_id = auto_task_id("auto_after_func_with_args", now);
        }
        let task: TaskFn = Arc::new(move |id, args| {
            trace!(task_id = id, "task fired");
            f(id, args);
        });
        self.spawn_timer(now + delay.as_millis() as i64, task, task_id, Some(args))
    }

    /// Run `f` according to `scheduler`'s plan.
    ///
    /// Returns `None` when the plan yields no first firing time. Each firing
    /// re-arms the next one from the timer's own expiration *before* invoking
    /// `f`, so the plan keeps its cadence even when callbacks are slow.
    pub fn schedule_func<S, F>(&self, scheduler: S, f: F) -> Option<Timer>
    where
        S: Scheduler + Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let task_id = auto_task_id("auto_scheduler", self.core.clock.now_ms());
        let task: TaskFn = Arc::new(move |id, _args| {
            trace!(task_id = id, "task fired");
            f();
        });
        self.schedule_timer(scheduler, task_id, None, task)
    }

    /// Like [`schedule_func`], with a task id and payload.
    ///
    /// [`schedule_func`]: TimingWheel::schedule_func
    pub fn schedule_func_with_args<S, F>(
        &self,
        scheduler: S,
        f: F,
        id: impl Into<String>,
        args: TaskArgs,
    ) -> Option<Timer>
    where
        S: Scheduler + Send + Sync + 'static,
        F: Fn(&str, Option<&TaskArgs>) + Send + Sync + 'static,
    {
        let mut task_id = id.into();
        if task_id.is_empty() {
            task_id = auto_task_id("auto_scheduler_with_args", self.core.clock.now_ms());
        }
        let task: TaskFn = Arc::new(move |id, args| {
            trace!(task_id = id, "task fired");
            f(id, args);
        });
        self.schedule_timer(scheduler, task_id, Some(args), task)
    }

    fn spawn_timer(
        &self,
        expiration: i64,
        task: TaskFn,
        task_id: String,
        args: Option<TaskArgs>,
    ) -> Timer {
        let inner = Arc::new(TimerInner::new(expiration, task, task_id, args));
        self.core.add_or_run(Arc::clone(&inner));
        Timer { inner }
    }

    fn schedule_timer<S>(
        &self,
        scheduler: S,
        task_id: String,
        args: Option<TaskArgs>,
        user_task: TaskFn,
    ) -> Option<Timer>
    where
        S: Scheduler + Send + Sync + 'static,
    {
        let first = scheduler.next(self.core.clock.now_ms())?;
        let scheduler = Arc::new(scheduler);
        let core = Arc::downgrade(&self.core);

        let inner = Arc::new_cyclic(|weak: &Weak<TimerInner>| {
            let weak = weak.clone();
            let task: TaskFn = Arc::new(move |id, args| {
                // Re-arm from the timer's own expiration before the user
                // callback runs; successive firings keep their cadence and
                // the gap where a stop can miss stays minimal.
                if let (Some(core), Some(timer)) = (core.upgrade(), weak.upgrade()) {
                    if let Some(next) = scheduler.next(timer.expiration()) {
                        timer.set_expiration(next);
                        core.add_or_run(timer);
                    }
                }
                user_task(id, args);
            });
            TimerInner::new(first, task, task_id, args)
        });

        self.core.add_or_run(Arc::clone(&inner));
        Some(Timer { inner })
    }
}

fn auto_task_id(prefix: &str, now_ms: i64) -> String {
    format!("{prefix}_{}_{now_ms}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded as channel;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Once;

    struct InlineExecutor;

    impl Executor for InlineExecutor {
        fn spawn(&self, task: Task) {
            task();
        }
    }

    fn init_test_logging() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }

    fn started_wheel(tick_ms: u64, wheel_size: i64) -> TimingWheel {
        init_test_logging();
        let tw = TimingWheel::new(Duration::from_millis(tick_ms), wheel_size).unwrap();
        tw.start();
        tw
    }

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn sleep_until(deadline_ms: i64) {
        let remaining = deadline_ms - SystemClock.now_ms();
        if remaining > 0 {
            sleep_ms(remaining as u64);
        }
    }

    // ==================== Construction ====================

    #[test]
    fn test_sub_millisecond_tick_rejected() {
        let err = TimingWheel::new(Duration::from_micros(100), 20).unwrap_err();
        assert!(matches!(err, Error::TickTooSmall(_)));
    }

    #[test]
    fn test_nonpositive_wheel_size_rejected() {
        let err = TimingWheel::new(Duration::from_millis(1), 0).unwrap_err();
        assert_eq!(err, Error::InvalidWheelSize(0));
    }

    // ==================== Immediate Dispatch ====================

    #[test]
    fn test_zero_delay_runs_without_driver() {
        let tw = TimingWheel::builder(Duration::from_millis(1), 20)
            .executor(Arc::new(InlineExecutor))
            .build()
            .unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        tw.after_func(Duration::ZERO, move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    // ==================== AfterFunc ====================

    #[test]
    fn test_after_func_fires_near_deadline() {
        let tw = started_wheel(1, 20);
        let (tx, rx) = channel();
        let start = SystemClock.now_ms();

        for delay in [1i64, 9, 18, 27, 36] {
            let tx = tx.clone();
            let expected = start + delay;
            tw.after_func(Duration::from_millis(delay as u64), move || {
                tx.send((expected, SystemClock.now_ms())).unwrap();
            });
        }

        for _ in 0..5 {
            let (expected, fired) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            let skew = (fired - expected).abs();
            assert!(skew <= 7, "fired {skew}ms away from its deadline");
        }
        tw.stop();
    }

    #[test]
    fn test_after_func_with_args_passes_id_and_payload() {
        let tw = started_wheel(1, 20);
        let (tx, rx) = channel();
        let args: TaskArgs = Arc::new(String::from("payload"));

        tw.after_func_with_args(
            Duration::from_millis(5),
            move |id, args| {
                let payload = args
                    .and_then(|a| a.downcast_ref::<String>())
                    .cloned()
                    .unwrap_or_default();
                tx.send((id.to_owned(), payload)).unwrap();
            },
            "job-42",
            args,
        );

        let (id, payload) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(id, "job-42");
        assert_eq!(payload, "payload");
        tw.stop();
    }

    #[test]
    fn test_generated_task_ids_are_unique_and_prefixed() {
        let tw = TimingWheel::builder(Duration::from_millis(1), 20)
            .executor(Arc::new(InlineExecutor))
            .build()
            .unwrap();

        let a = tw.after_func(Duration::from_secs(60), || {});
        let b = tw.after_func(Duration::from_secs(60), || {});
        assert!(a.task_id().starts_with("auto_after_func_"));
        assert!(b.task_id().starts_with("auto_after_func_"));
        assert_ne!(a.task_id(), b.task_id());

        let c = tw.after_func_with_args(Duration::from_secs(60), |_, _| {}, "", Arc::new(0u8));
        assert!(c.task_id().starts_with("auto_after_func_with_args_"));

        a.stop();
        b.stop();
        c.stop();
    }

    // ==================== Stop ====================

    #[test]
    fn test_stop_prevents_firing() {
        let tw = started_wheel(1, 20);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let timer = tw.after_func(Duration::from_millis(50), move || {
            flag.store(true, Ordering::SeqCst);
        });
        sleep_ms(10);
        assert!(timer.stop());

        sleep_ms(100);
        assert!(!fired.load(Ordering::SeqCst));
        tw.stop();
    }

    #[test]
    fn test_stop_after_firing_returns_false() {
        let tw = started_wheel(1, 20);
        let (tx, rx) = channel();

        let timer = tw.after_func(Duration::from_millis(1), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        sleep_ms(20);

        assert!(!timer.stop());
        tw.stop();
    }

    #[test]
    fn test_stopped_wheel_fires_nothing() {
        let tw = started_wheel(1, 20);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        tw.after_func(Duration::from_millis(30), move || {
            flag.store(true, Ordering::SeqCst);
        });
        tw.stop();

        sleep_ms(60);
        assert!(!fired.load(Ordering::SeqCst));
    }

    // ==================== Overflow Cascade ====================

    #[test]
    fn test_timer_migrates_from_overflow_to_inner_wheel() {
        // tick=1ms, 20 slots: the inner level spans 20ms, so a +50ms timer
        // starts in the overflow level (tick=20ms). Align the deadline to
        // fall 10ms past a coarse boundary so the migration window is wide
        // enough to observe.
        let tw = started_wheel(1, 20);
        let (tx, rx) = channel();

        let start = SystemClock.now_ms();
        let pad = (20 - start % 20) % 20;
        let delay = (pad + 50) as u64;

        let timer = tw.after_func(Duration::from_millis(delay), move || {
            tx.send(SystemClock.now_ms()).unwrap();
        });
        let deadline = timer.expiration_ms();
        let coarse_deadline = deadline - deadline % 20;
        // Scheduling may slip a millisecond; the deadline still lands well
        // inside a coarse slot, leaving an observable migration window.
        assert!((8..=14).contains(&(deadline - coarse_deadline)));

        // Still parked in the coarse level: its bucket carries the
        // truncated deadline.
        sleep_until(coarse_deadline - 8);
        let bucket = timer.inner.bucket().expect("timer should be bucketed");
        assert_eq!(bucket.expiration(), coarse_deadline);

        // After the coarse bucket expired, the cascade re-bucketed the
        // timer in the inner level at its exact deadline.
        sleep_until(coarse_deadline + 5);
        let bucket = timer.inner.bucket().expect("timer should be re-bucketed");
        assert_eq!(bucket.expiration(), deadline);

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(
            (fired - deadline).abs() <= 7,
            "fired {}ms away from its deadline",
            fired - deadline
        );
        tw.stop();
    }

    // ==================== Recurring Schedules ====================

    struct ThreeTimes {
        calls: AtomicUsize,
    }

    impl Scheduler for ThreeTimes {
        fn next(&self, previous_ms: i64) -> Option<i64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Some(previous_ms + 10)
            } else {
                None
            }
        }
    }

    #[test]
    fn test_schedule_func_fires_plan_then_stops() {
        let tw = started_wheel(1, 20);
        let (tx, rx) = channel();

        let timer = tw.schedule_func(
            ThreeTimes {
                calls: AtomicUsize::new(0),
            },
            move || {
                tx.send(SystemClock.now_ms()).unwrap();
            },
        );
        assert!(timer.is_some());

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        for pair in fired.windows(2) {
            let gap = pair[1] - pair[0];
            assert!((gap - 10).abs() <= 7, "firing gap was {gap}ms");
        }

        // The plan is exhausted: no fourth firing.
        assert!(rx.recv_timeout(Duration::from_millis(60)).is_err());
        tw.stop();
    }

    #[test]
    fn test_exhausted_plan_yields_no_timer() {
        struct Never;
        impl Scheduler for Never {
            fn next(&self, _previous_ms: i64) -> Option<i64> {
                None
            }
        }

        let tw = started_wheel(1, 20);
        assert!(tw.schedule_func(Never, || {}).is_none());
        tw.stop();
    }

    #[test]
    fn test_recurring_timer_can_be_stopped_midway() {
        let tw = started_wheel(1, 20);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let timer = tw
            .schedule_func(Every::new(Duration::from_millis(20)).unwrap(), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        sleep_ms(50);
        timer.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 1, "expected at least one firing before stop");

        sleep_ms(60);
        assert_eq!(count.load(Ordering::SeqCst), seen);
        tw.stop();
    }

    // ==================== Load ====================

    #[test]
    fn test_many_concurrent_timers_all_fire() {
        let tw = started_wheel(1, 64);
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel();

        for i in 0..500u64 {
            let counter = Arc::clone(&count);
            let tx = tx.clone();
            tw.after_func(Duration::from_millis(1 + i % 40), move || {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 == 500 {
                    tx.send(()).unwrap();
                }
            });
        }

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 500);
        tw.stop();
    }

    #[test]
    fn test_concurrent_stop_and_fire_never_both_win() {
        // A stop that returns true must mean the task never runs.
        let tw = started_wheel(1, 20);
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timers = Vec::new();

        for _ in 0..200 {
            let counter = Arc::clone(&fired);
            timers.push(tw.after_func(Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        sleep_ms(5);
        let stopped = timers.iter().filter(|t| t.stop()).count();
        sleep_ms(50);

        assert_eq!(stopped + fired.load(Ordering::SeqCst), 200);
        tw.stop();
    }
}
