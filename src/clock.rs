//! Wall-clock abstraction.
//!
//! Components that stamp or compare timestamps (circuit breakers, the
//! dead-letter queue, monitoring) read time through `Clock` so tests can
//! drive them with a `ManualClock` instead of sleeping.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `at - age`, clamped to the representable range.
pub fn saturating_sub(at: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(age).unwrap_or(if age > Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// `at + by`, clamped to the representable range.
pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(if by > Duration::zero() {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

/// Whole seconds as a `Duration`, saturating instead of panicking.
pub fn seconds(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Shared handle to the system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Virtual clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn test_saturating_arithmetic_clamps_at_range_edges() {
        let now = Utc::now();
        assert_eq!(saturating_sub(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(saturating_add(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(saturating_sub(now, Duration::hours(1)), now - Duration::hours(1));
    }

    #[test]
    fn test_seconds_saturates_on_huge_values() {
        assert_eq!(seconds(90), Duration::seconds(90));
        assert_eq!(seconds(u64::MAX), Duration::MAX);
        assert_eq!(seconds(i64::MAX as u64), Duration::MAX);
    }
}
