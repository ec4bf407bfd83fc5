//! Deadline handles for the sans-I/O session.
//!
//! Nothing here sleeps. Owners arm deadlines, report the earliest one through
//! `next_deadline()`, and are polled with the current instant once it passes.

use std::time::Duration;
use tokio::time::Instant;

/// One-shot deadline.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arm the timer to fire `after` from `now`.
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.deadline = Some(now + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Disarm and return `true` if the deadline has passed.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(at) if at <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Rate limiter with an optional leading edge and a trailing edge.
///
/// Within one window the latest value wins. A trailing emission opens a new
/// window, so emissions are always at least `interval` apart.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: Duration,
    leading: bool,
    window_end: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    /// Leading + trailing edges.
    pub fn leading(interval: Duration) -> Self {
        Self {
            interval,
            leading: true,
            window_end: None,
            pending: None,
        }
    }

    /// Trailing edge only.
    pub fn trailing(interval: Duration) -> Self {
        Self {
            interval,
            leading: false,
            window_end: None,
            pending: None,
        }
    }

    /// Offer a value. Returns it straight back on a leading edge.
    pub fn call(&mut self, now: Instant, value: T) -> Option<T> {
        if let Some(end) = self.window_end {
            if now < end {
                self.pending = Some(value);
                return None;
            }
        }
        self.window_end = Some(now + self.interval);
        if self.leading {
            self.pending = None;
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Emit the trailing value if its window has closed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let end = self.window_end?;
        if now < end {
            return None;
        }
        match self.pending.take() {
            Some(value) => {
                self.window_end = Some(now + self.interval);
                Some(value)
            }
            None => {
                self.window_end = None;
                None
            }
        }
    }

    /// When `poll` next has something to emit.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and(self.window_end)
    }

    pub fn cancel(&mut self) {
        self.window_end = None;
        self.pending = None;
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_timer_fires_once() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.arm(t0, 10 * MS);
        assert!(!timer.fire_if_due(t0 + 9 * MS));
        assert!(timer.fire_if_due(t0 + 10 * MS));
        assert!(!timer.fire_if_due(t0 + 20 * MS));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_timer_cancel() {
        let t0 = Instant::now();
        let mut timer = Timer::new();
        timer.arm(t0, MS);
        timer.cancel();
        assert!(!timer.fire_if_due(t0 + 5 * MS));
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn test_leading_throttle_latest_sample_wins() {
        let t0 = Instant::now();
        let mut th = Throttle::leading(33 * MS);
        assert_eq!(th.call(t0, 1), Some(1));
        assert_eq!(th.call(t0 + 5 * MS, 2), None);
        assert_eq!(th.call(t0 + 10 * MS, 3), None);
        assert_eq!(th.deadline(), Some(t0 + 33 * MS));
        assert_eq!(th.poll(t0 + 20 * MS), None);
        assert_eq!(th.poll(t0 + 33 * MS), Some(3));
        // The trailing emission opened a new window.
        assert_eq!(th.call(t0 + 40 * MS, 4), None);
        assert_eq!(th.poll(t0 + 66 * MS), Some(4));
    }

    #[test]
    fn test_leading_throttle_quiet_window_closes() {
        let t0 = Instant::now();
        let mut th = Throttle::leading(33 * MS);
        assert_eq!(th.call(t0, 1), Some(1));
        assert_eq!(th.deadline(), None);
        assert_eq!(th.poll(t0 + 40 * MS), None);
        assert_eq!(th.call(t0 + 41 * MS, 2), Some(2));
    }

    #[test]
    fn test_trailing_throttle_collapses_burst() {
        let t0 = Instant::now();
        let mut th = Throttle::trailing(20 * MS);
        assert_eq!(th.call(t0, ()), None);
        assert_eq!(th.call(t0 + MS, ()), None);
        assert_eq!(th.call(t0 + 19 * MS, ()), None);
        assert_eq!(th.poll(t0 + 20 * MS), Some(()));
        assert_eq!(th.poll(t0 + 25 * MS), None);
        assert_eq!(th.deadline(), None);
    }

    #[test]
    fn test_throttle_late_call_starts_fresh_window() {
        let t0 = Instant::now();
        let mut th = Throttle::trailing(20 * MS);
        th.call(t0, 1);
        // Window elapsed without a poll: the newer value supersedes.
        assert_eq!(th.call(t0 + 50 * MS, 2), None);
        assert_eq!(th.deadline(), Some(t0 + 70 * MS));
        assert_eq!(th.poll(t0 + 70 * MS), Some(2));
    }

    #[test]
    fn test_throttle_cancel() {
        let t0 = Instant::now();
        let mut th = Throttle::trailing(20 * MS);
        th.call(t0, 1);
        th.cancel();
        assert_eq!(th.poll(t0 + 30 * MS), None);
        assert_eq!(th.deadline(), None);
    }

    #[test]
    fn test_earliest() {
        let t0 = Instant::now();
        assert_eq!(earliest([None, Some(t0 + MS), Some(t0)]), Some(t0));
        assert_eq!(earliest([None, None]), None);
    }
}
