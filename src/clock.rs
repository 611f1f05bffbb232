//! Time sources.
//!
//! Watch time is accrued from the monotonic part of [`ObservedAt`] so wall
//! clock adjustments can't inflate or shrink it. The wall part is what gets
//! recorded on scrobbles and compared across restarts.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// The moment a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedAt {
    /// Offset from the clock's origin. Only comparable within one process.
    pub monotonic: Duration,
    /// Wall-clock time.
    pub wall: DateTime<Utc>,
}

/// Source of [`ObservedAt`] timestamps.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> ObservedAt;
}

/// Real clock backed by `Instant` and `Utc::now`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> ObservedAt {
        ObservedAt {
            monotonic: self.origin.elapsed(),
            wall: Utc::now(),
        }
    }
}

/// Hand-driven clock for tests and replaying recorded polls.
///
/// Both parts move together on [`advance`](Self::advance); the wall part can
/// also be set independently to simulate clock adjustments.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ObservedAt>,
}

impl ManualClock {
    /// Start at monotonic zero and the given wall time.
    #[must_use]
    pub const fn new(wall: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ObservedAt {
                monotonic: Duration::ZERO,
                wall,
            }),
        }
    }

    /// Move both clocks forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        now.monotonic += by;
        now.wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Jump the wall clock without touching the monotonic one.
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.lock().wall = wall;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ObservedAt> {
        // A poisoned guard still holds a valid timestamp.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ObservedAt {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances_both_parts() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(90));

        let now = clock.now();
        assert_eq!(now.monotonic, Duration::from_secs(90));
        assert_eq!(now.wall, start + chrono::Duration::seconds(90));
    }

    #[test]
    fn test_manual_clock_wall_jump_leaves_monotonic_alone() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(5));
        clock.set_wall(start - chrono::Duration::hours(3));

        let now = clock.now();
        assert_eq!(now.monotonic, Duration::from_secs(5));
        assert_eq!(now.wall, start - chrono::Duration::hours(3));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b.monotonic >= a.monotonic);
    }
}
