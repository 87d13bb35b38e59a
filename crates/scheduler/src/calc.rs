//! Schedule calculation — pure next-fire computation for every schedule kind.

use chrono::{TimeZone, Utc};

use crate::cron::{next_occurrence_tz, parse_tz};
use crate::model::{Schedule, TimestampMs};

/// Current epoch time in milliseconds.
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Compute the next fire instant for `schedule`, or `None` when the schedule
/// has no future firings.
///
/// - `At`: the target instant when still in the future.
/// - `Every`: `last_run + interval`, skipping past slots so a stopped
///   scheduler never fires a catch-up burst; first arm is `now + interval`.
/// - `Cron`: smallest firing instant strictly greater than `now`, evaluated
///   in the schedule's timezone.
pub fn next_fire_ms(
    schedule: &Schedule,
    now_ms: TimestampMs,
    last_run_ms: Option<TimestampMs>,
) -> Option<TimestampMs> {
    match schedule {
        Schedule::At { at_ms } => {
            if *at_ms > now_ms {
                Some(*at_ms)
            } else {
                None
            }
        }
        Schedule::Every { interval_ms } => {
            if *interval_ms <= 0 {
                return None;
            }
            let last = match last_run_ms {
                None => return Some(now_ms + interval_ms),
                Some(last) => last,
            };
            let mut next = last + interval_ms;
            while next <= now_ms {
                next += interval_ms;
            }
            Some(next)
        }
        Schedule::Cron {
            expression,
            timezone,
        } => {
            let after = Utc.timestamp_millis_opt(now_ms).single()?;
            let tz = parse_tz(timezone);
            next_occurrence_tz(expression, &after, tz).map(|dt| dt.timestamp_millis())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_in_future_fires_at_target() {
        let s = Schedule::At { at_ms: 10_000 };
        assert_eq!(next_fire_ms(&s, 5_000, None), Some(10_000));
    }

    #[test]
    fn at_in_past_never_fires() {
        let s = Schedule::At { at_ms: 10_000 };
        assert_eq!(next_fire_ms(&s, 10_000, None), None);
        assert_eq!(next_fire_ms(&s, 20_000, None), None);
    }

    #[test]
    fn every_first_arm_has_no_backfill() {
        let s = Schedule::Every { interval_ms: 1_000 };
        assert_eq!(next_fire_ms(&s, 5_000, None), Some(6_000));
    }

    #[test]
    fn every_spaces_from_last_run() {
        let s = Schedule::Every { interval_ms: 1_000 };
        assert_eq!(next_fire_ms(&s, 5_100, Some(5_000)), Some(6_000));
    }

    #[test]
    fn every_skips_missed_slots() {
        // Stopped for 10 minutes with a 60s interval: exactly one future slot.
        let s = Schedule::Every { interval_ms: 60_000 };
        let last = 0;
        let now = 600_000;
        let next = next_fire_ms(&s, now, Some(last)).unwrap();
        assert_eq!(next, 660_000);
        assert!(next > now);
    }

    #[test]
    fn every_rejects_nonpositive_interval() {
        assert_eq!(next_fire_ms(&Schedule::Every { interval_ms: 0 }, 0, None), None);
        assert_eq!(next_fire_ms(&Schedule::Every { interval_ms: -5 }, 0, None), None);
    }

    #[test]
    fn cron_next_is_strictly_future() {
        let s = Schedule::Cron {
            expression: "0 9 * * *".into(),
            timezone: "Asia/Shanghai".into(),
        };
        // 2024-01-15 14:00 local (+08:00).
        let now = Utc
            .with_ymd_and_hms(2024, 1, 15, 6, 0, 0)
            .unwrap()
            .timestamp_millis();
        let next = next_fire_ms(&s, now, None).unwrap();
        let expected = Utc
            .with_ymd_and_hms(2024, 1, 16, 1, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(next, expected);
        assert!(next > now);
    }

    #[test]
    fn cron_minute_step_pattern() {
        let s = Schedule::Cron {
            expression: "*/30 * * * *".into(),
            timezone: "UTC".into(),
        };
        let now = Utc
            .with_ymd_and_hms(2024, 6, 15, 10, 10, 0)
            .unwrap()
            .timestamp_millis();
        let next = next_fire_ms(&s, now, None).unwrap();
        let expected = Utc
            .with_ymd_and_hms(2024, 6, 15, 10, 30, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn cron_is_deterministic() {
        let s = Schedule::Cron {
            expression: "15 3 * * 1-5".into(),
            timezone: "Europe/London".into(),
        };
        let now = 1_700_000_000_000;
        assert_eq!(next_fire_ms(&s, now, None), next_fire_ms(&s, now, None));
    }

    #[test]
    fn cron_invalid_expression_yields_none() {
        let s = Schedule::Cron {
            expression: "not a cron".into(),
            timezone: "UTC".into(),
        };
        assert_eq!(next_fire_ms(&s, 1_700_000_000_000, None), None);
    }
}
