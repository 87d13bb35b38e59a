//! Cron expression parsing and evaluation (5-field: min hour dom month dow).
//!
//! An expression is compiled once into per-field sets of permitted values;
//! finding the next firing walks dates and picks the smallest permitted
//! wall-clock minute of the first matching date. Day-of-week 0 is Sunday
//! and 7 is folded into 0 at parse time.

use chrono::{Datelike, NaiveDate, Timelike};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Resolve an IANA timezone name, defaulting to UTC when unknown.
pub fn parse_tz(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => Tz::UTC,
    }
}

/// How many dates to probe before concluding the expression never fires.
/// Four years reaches the next leap day from any starting point.
const DATE_SEARCH_LIMIT: u32 = 4 * 366;

/// A compiled 5-field expression. Each mask holds one bit per permitted
/// value of that field.
#[derive(Clone, Copy, Debug)]
pub struct CronExpr {
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

/// Compile one field into its permitted-value mask. `span` is the legal
/// range of the field, inclusive on both ends.
fn compile_field(text: &str, name: &str, span: (u32, u32)) -> Result<u64> {
    let (lo, hi) = span;
    let bad = |detail: String| Error::validation("cron", format!("{name}: {detail}"));

    // A whole-field wildcard, optionally with a step.
    let step = if text == "*" {
        Some(1)
    } else if let Some(step_text) = text.strip_prefix("*/") {
        let step = step_text
            .parse::<u32>()
            .map_err(|_| bad(format!("bad step '{text}'")))?;
        if step == 0 || step > hi {
            return Err(bad(format!("step {step} not in 1..={hi}")));
        }
        Some(step)
    } else {
        None
    };
    if let Some(step) = step {
        return Ok((lo..=hi)
            .filter(|v| v % step == 0)
            .fold(0u64, |mask, v| mask | 1 << v));
    }

    // Otherwise a comma list of single values and inclusive ranges.
    let mut mask = 0u64;
    for piece in text.split(',') {
        let (first, last) = match piece.split_once('-') {
            Some((a, b)) => {
                let first = a.parse::<u32>().map_err(|_| bad(format!("bad range '{piece}'")))?;
                let last = b.parse::<u32>().map_err(|_| bad(format!("bad range '{piece}'")))?;
                if first > last {
                    return Err(bad(format!("range '{piece}' runs backwards")));
                }
                (first, last)
            }
            None => {
                let v = piece.parse::<u32>().map_err(|_| bad(format!("bad value '{piece}'")))?;
                (v, v)
            }
        };
        if first < lo || last > hi {
            return Err(bad(format!("'{piece}' outside {lo}..={hi}")));
        }
        for v in first..=last {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

impl CronExpr {
    /// Compile an expression, rejecting anything the evaluator cannot fire.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::validation(
                "cron",
                format!(
                    "expected 5 fields (minute hour day month weekday), got {}",
                    fields.len()
                ),
            ));
        }

        let minutes = compile_field(fields[0], "minute", (0, 59))?;
        let hours = compile_field(fields[1], "hour", (0, 23))?;
        let days = compile_field(fields[2], "day-of-month", (1, 31))?;
        let months = compile_field(fields[3], "month", (1, 12))?;
        let mut weekdays = compile_field(fields[4], "day-of-week", (0, 7))?;
        // Both spellings of Sunday land on bit 0.
        if bit(weekdays, 7) {
            weekdays |= 1;
            weekdays &= !(1u64 << 7);
        }

        Ok(Self {
            minutes,
            hours,
            days,
            months,
            weekdays,
        })
    }

    fn allows_date(&self, date: NaiveDate) -> bool {
        bit(self.months, date.month())
            && bit(self.days, date.day())
            && bit(self.weekdays, date.weekday().num_days_from_sunday())
    }

    /// Smallest permitted wall-clock minute, constrained to fall strictly
    /// after `floor` when one is given.
    fn earliest_time(&self, floor: Option<(u32, u32)>) -> Option<(u32, u32)> {
        for hour in 0..24 {
            if !bit(self.hours, hour) {
                continue;
            }
            for minute in 0..60 {
                if !bit(self.minutes, minute) {
                    continue;
                }
                match floor {
                    Some((fh, _)) if hour < fh => break,
                    Some((fh, fm)) if hour == fh && minute <= fm => continue,
                    _ => return Some((hour, minute)),
                }
            }
        }
        None
    }

    /// First firing instant strictly after `after`, evaluated on `tz`'s wall
    /// clock and returned in UTC.
    ///
    /// Wall-clock minutes erased by a spring-forward jump are passed over;
    /// a minute that occurs twice at fall-back resolves to its first
    /// occurrence.
    pub fn next_after(
        &self,
        after: &chrono::DateTime<chrono::Utc>,
        tz: Tz,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        use chrono::TimeZone;

        let local = after.with_timezone(&tz).naive_local();
        let mut date = local.date();
        let mut floor = Some((local.hour(), local.minute()));

        for _ in 0..DATE_SEARCH_LIMIT {
            if self.allows_date(date) {
                let mut cursor = floor;
                while let Some((hour, minute)) = self.earliest_time(cursor) {
                    let wall = date.and_hms_opt(hour, minute, 0)?;
                    match tz.from_local_datetime(&wall) {
                        chrono::LocalResult::Single(dt) => {
                            return Some(dt.with_timezone(&chrono::Utc));
                        }
                        chrono::LocalResult::Ambiguous(first, _) => {
                            return Some(first.with_timezone(&chrono::Utc));
                        }
                        chrono::LocalResult::None => {
                            // Erased by the DST jump; try the next permitted
                            // minute of the same date.
                            cursor = Some((hour, minute));
                        }
                    }
                }
            }
            floor = None;
            date = date.succ_opt()?;
        }
        None
    }
}

/// Convenience wrapper: compile and evaluate in one call. Malformed
/// expressions yield `None`.
pub fn next_occurrence_tz(
    expression: &str,
    after: &chrono::DateTime<chrono::Utc>,
    tz: Tz,
) -> Option<chrono::DateTime<chrono::Utc>> {
    CronExpr::parse(expression).ok()?.next_after(after, tz)
}
