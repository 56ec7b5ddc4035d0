//! Wall and logical clocks.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use ledgersync_common::Timestamp;

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to. For tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Per-session logical clock.
///
/// Every `tick` is strictly greater than the previous one and than any
/// timestamp passed to `observe`, while tracking wall time when it is ahead.
pub struct LogicalClock {
    source: Arc<dyn Clock>,
    last: AtomicI64,
}

impl LogicalClock {
    /// Create a clock whose first tick is above `floor`.
    pub fn new(source: Arc<dyn Clock>, floor: Option<Timestamp>) -> Self {
        Self {
            source,
            last: AtomicI64::new(floor.unwrap_or(i64::MIN)),
        }
    }

    /// Next timestamp for a local change.
    pub fn tick(&self) -> Timestamp {
        let wall = self.source.now();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    /// Record a timestamp seen elsewhere (e.g. a remote `last_modified`).
    pub fn observe(&self, seen: Timestamp) {
        self.last.fetch_max(seen, Ordering::SeqCst);
    }

    /// Current wall-clock time, unaffected by observations.
    pub fn wall_now(&self) -> Timestamp {
        self.source.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_follows_wall_clock() {
        let wall = Arc::new(ManualClock::new(1000));
        let clock = LogicalClock::new(wall.clone(), None);

        assert_eq!(clock.tick(), 1000);
        wall.set(1500);
        assert_eq!(clock.tick(), 1500);
    }

    #[test]
    fn test_tick_never_decreases() {
        let wall = Arc::new(ManualClock::new(1000));
        let clock = LogicalClock::new(wall.clone(), None);

        let first = clock.tick();
        wall.set(10);
        let second = clock.tick();
        let third = clock.tick();

        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_floor_and_observe() {
        let wall = Arc::new(ManualClock::new(100));
        let clock = LogicalClock::new(wall, Some(500));
        assert_eq!(clock.tick(), 501);

        clock.observe(2000);
        assert_eq!(clock.tick(), 2001);

        clock.observe(5);
        assert_eq!(clock.tick(), 2002);
    }
}
