//! Time source for bake timers and condition timestamps
//!
//! `SystemClock` reads the wall clock. `MockClock` lets canary tests step
//! through bake periods without sleeping.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock shared between a test and the reconciler context
#[cfg(test)]
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

    /// Fixed start instant used by scenario tests
    pub fn at_epoch() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
        )
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += chrono::Duration::seconds(secs);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}

/// Parse an RFC3339 timestamp written into status by `now()`
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now().timestamp() > 1_577_836_800);
    }

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::at_epoch();
        let start = clock.now();
        clock.advance_secs(90);
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_parse_timestamp_round_trips_now() {
        let clock = MockClock::at_epoch();
        let written = clock.now().to_rfc3339();
        assert_eq!(parse_timestamp(&written), Some(clock.now()));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
