//! Time source shared by the tracer, the orchestrator and the task runner.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtcClock;

impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock: every reading advances by a fixed step.
///
/// Used wherever identical inputs must produce identical traces.
#[derive(Debug)]
pub struct SteppingClock {
    origin: DateTime<Utc>,
    step_ms: i64,
    ticks: AtomicI64,
}

impl SteppingClock {
    pub fn new(origin: DateTime<Utc>, step_ms: i64) -> Self {
        Self {
            origin,
            step_ms,
            ticks: AtomicI64::new(0),
        }
    }

    /// Reading the clock without advancing it.
    pub fn peek(&self) -> DateTime<Utc> {
        self.origin + Duration::milliseconds(self.ticks.load(Ordering::SeqCst) * self.step_ms)
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        self.origin + Duration::milliseconds(tick * self.step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stepping_clock_advances_per_reading() {
        let origin = Utc::now();
        let clock = SteppingClock::new(origin, 10);
        assert_eq!(clock.now(), origin);
        assert_eq!(clock.now(), origin + Duration::milliseconds(10));
        assert_eq!(clock.peek(), origin + Duration::milliseconds(20));
    }

    #[test]
    fn test_utc_clock_is_monotonic_enough() {
        let clock = UtcClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
