use std::time::Duration;

/// An execution plan for a recurring timer.
///
/// `next` maps the previous firing time (UTC milliseconds) to the next one;
/// `None` means the plan is exhausted and no further firing happens. The
/// driver asks for firing n+1 from the timer's own expiration, not from the
/// wall clock, so plans do not accumulate drift.
pub trait Scheduler {
    fn next(&self, previous_ms: i64) -> Option<i64>;
}

/// Fires at a fixed period, forever.
#[derive(Debug, Clone, Copy)]
pub struct Every {
    interval_ms: i64,
}

impl Every {
    /// Periods below one millisecond are rejected: the wheel cannot
    /// represent them and a zero period would fire in a tight loop.
    pub fn new(interval: Duration) -> Option<Self> {
        let interval_ms = interval.as_millis() as i64;
        if interval_ms <= 0 {
            return None;
        }
        Some(Self { interval_ms })
    }
}

impl Scheduler for Every {
    fn next(&self, previous_ms: i64) -> Option<i64> {
        Some(previous_ms + self.interval_ms)
    }
}
