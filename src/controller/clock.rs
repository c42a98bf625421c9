//! Clock abstraction for status timestamps
//!
//! Production code uses `SystemClock`. Tests use `MockClock` so that
//! `lastTransitionTime` values are deterministic.

use chrono::{DateTime, Utc};

/// Source of the current time, injected via `Context`
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Clock fixed at midnight UTC on the given day
    pub fn at_midnight(year: i32, month: u32, day: u32) -> Self {
        use chrono::TimeZone;
        Self::new(
            Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
                .single()
                .expect("valid date"),
        )
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_returns_time() {
        // After 2020-01-01
        assert!(SystemClock.now().timestamp() > 1_577_836_800);
    }

    #[test]
    fn test_mock_clock_formats_as_rfc3339() {
        let clock = MockClock::at_midnight(2024, 1, 1);
        assert_eq!(clock.now().to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::at_midnight(2024, 1, 1);
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now().to_rfc3339(), "2024-01-01T00:00:05+00:00");
    }
}
