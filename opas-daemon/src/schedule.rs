//! Daily trigger arithmetic.
//!
//! The scheduler fires once per day at a fixed UTC time. A missed trigger is
//! never retried; the next run fetches current upstream state anyway, so the
//! pipeline self-heals.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

/// The next instant strictly after `now` at `hour:minute` UTC.
///
/// Today's occurrence if it is still ahead, otherwise tomorrow's.
pub fn next_fire_after(now: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let today = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), hour, minute, 0)
        .single()
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Sleep duration until the next fire, clamped at zero.
pub fn wait_until(now: DateTime<Utc>, fire_at: DateTime<Utc>) -> std::time::Duration {
    (fire_at - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn fires_later_today_when_time_is_ahead() {
        let now = at(2026, 8, 27, 1, 0, 0);
        assert_eq!(next_fire_after(now, 3, 30), at(2026, 8, 27, 3, 30, 0));
    }

    #[test]
    fn fires_tomorrow_when_time_has_passed() {
        let now = at(2026, 8, 27, 4, 0, 0);
        assert_eq!(next_fire_after(now, 3, 30), at(2026, 8, 28, 3, 30, 0));
    }

    #[test]
    fn exact_fire_instant_rolls_to_tomorrow() {
        // Strictly after `now`, so firing at 03:30:00 sharp schedules the
        // next occurrence rather than an immediate re-fire.
        let now = at(2026, 8, 27, 3, 30, 0);
        assert_eq!(next_fire_after(now, 3, 30), at(2026, 8, 28, 3, 30, 0));
    }

    #[test]
    fn rolls_over_month_and_year_boundaries() {
        let now = at(2026, 12, 31, 23, 59, 0);
        assert_eq!(next_fire_after(now, 3, 30), at(2027, 1, 1, 3, 30, 0));
    }

    #[test]
    fn wait_until_clamps_past_instants_to_zero() {
        let now = at(2026, 8, 27, 4, 0, 0);
        assert_eq!(
            wait_until(now, at(2026, 8, 27, 3, 0, 0)),
            std::time::Duration::ZERO
        );
        assert_eq!(
            wait_until(now, at(2026, 8, 27, 4, 0, 30)),
            std::time::Duration::from_secs(30)
        );
    }
}
