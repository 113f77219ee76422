use std::ops::Add;
use std::{
    sync::RwLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Source of wall-clock time.
///
/// Session liveness is judged against the timestamps the leader stamps into
/// log entries, so every server applying the log observes the same time.
/// Production code uses [`SystemClock`]; tests inject [`MockClock`] to drive
/// expiration deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Milliseconds since the unix epoch, the unit entry timestamps use.
    fn unix_millis(&self) -> i64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap()
    }
}

impl MockClock {
    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap();
        *now = now.add(duration);
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write().unwrap() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_advance_mock_clock() {
        // given
        let clock = MockClock::with_time(UNIX_EPOCH);

        // when
        clock.advance(Duration::from_millis(1500));

        // then
        assert_eq!(clock.unix_millis(), 1500);
    }

    #[test]
    fn should_report_set_time() {
        // given
        let clock = MockClock::new();

        // when
        clock.set_time(UNIX_EPOCH + Duration::from_secs(42));

        // then
        assert_eq!(clock.unix_millis(), 42_000);
    }
}
