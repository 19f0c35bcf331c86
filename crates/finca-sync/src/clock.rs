//! Injectable clock and the local start-of-day boundary for the same-day cache.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Local midnight of `now`'s calendar day in `tz`, as a UTC instant.
pub fn start_of_day(now: DateTime<Utc>, tz: FixedOffset) -> DateTime<Utc> {
    let local_midnight = now.with_timezone(&tz).date_naive().and_time(NaiveTime::MIN);
    let utc_naive = local_midnight - Duration::seconds(i64::from(tz.local_minus_utc()));
    DateTime::from_naive_utc_and_offset(utc_naive, Utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn start_of_day_uses_local_calendar_day() {
        let tz = FixedOffset::west_opt(6 * 3600).unwrap();
        // 03:00 UTC on the 3rd is still 21:00 on the 2nd in UTC-6.
        let now = Utc.with_ymd_and_hms(2026, 3, 3, 3, 0, 0).single().unwrap();
        assert_eq!(
            start_of_day(now, tz),
            Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).single().unwrap();
        let clock = FixedClock::new(start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
    }
}
