use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use cron::Schedule;

use crate::error::{Result, SchedulerError};

/// Convert a standard 5-field Unix cron expression to the 7-field format the
/// `cron` crate expects (seconds pinned to 0, any year). Six and seven field
/// expressions pass through untouched.
fn to_cron_crate_format(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {} *", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Parse a cron expression in any of the accepted field counts.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    Schedule::from_str(&to_cron_crate_format(expression)).map_err(|e| {
        SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Next scheduled instant strictly after `after`, or `None` when the
/// expression has no future occurrences (e.g. a past year).
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Compute the business date for a firing at `tick`.
///
/// Walks the job's own cron sequence `|adjustment|` occurrences forward
/// (positive) or backward (negative) from `tick` and returns that
/// occurrence's UTC date. `adjustment == 0` returns the tick's date.
///
/// `tick` should be the scheduled instant itself, not the wall clock at which
/// the timer woke up: occurrences are counted strictly after / strictly
/// before it.
pub fn business_date(schedule: &Schedule, tick: DateTime<Utc>, adjustment: i32) -> Option<NaiveDate> {
    let steps = adjustment.unsigned_abs() as usize;
    if steps == 0 {
        return Some(tick.date_naive());
    }

    let occurrence = if adjustment > 0 {
        schedule.after(&tick).nth(steps - 1)
    } else {
        schedule.after(&tick).rev().nth(steps - 1)
    };
    occurrence.map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn daily() -> Schedule {
        parse_cron("0 0 * * *").unwrap()
    }

    fn midnight(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn five_field_expressions_gain_seconds_and_year() {
        assert_eq!(to_cron_crate_format("0 0 * * *"), "0 0 0 * * * *");
        assert_eq!(to_cron_crate_format("*/5 * * * * *"), "*/5 * * * * *");
    }

    #[test]
    fn invalid_cron_is_reported_with_expression() {
        match parse_cron("not a cron") {
            Err(SchedulerError::InvalidCron { expression, .. }) => {
                assert_eq!(expression, "not a cron")
            }
            other => panic!("expected InvalidCron, got {other:?}"),
        }
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let tick = midnight(2024, 3, 10);
        assert_eq!(next_fire(&daily(), tick), Some(midnight(2024, 3, 11)));
    }

    #[test]
    fn zero_adjustment_keeps_tick_date() {
        let tick = midnight(2024, 3, 10);
        assert_eq!(business_date(&daily(), tick, 0), Some(date(2024, 3, 10)));
    }

    #[test]
    fn positive_adjustment_walks_forward() {
        let tick = midnight(2024, 3, 10);
        assert_eq!(business_date(&daily(), tick, 1), Some(date(2024, 3, 11)));
        assert_eq!(business_date(&daily(), tick, 2), Some(date(2024, 3, 12)));
    }

    #[test]
    fn negative_adjustment_walks_backward() {
        let tick = midnight(2024, 3, 10);
        assert_eq!(business_date(&daily(), tick, -1), Some(date(2024, 3, 9)));
        assert_eq!(business_date(&daily(), tick, -3), Some(date(2024, 3, 7)));
    }

    #[test]
    fn adjustment_counts_scheduled_occurrences_not_days() {
        let weekdays = parse_cron("0 0 * * MON-FRI").unwrap();
        // Monday 2024-03-11: one occurrence back is Friday 2024-03-08.
        let tick = midnight(2024, 3, 11);
        assert_eq!(business_date(&weekdays, tick, -1), Some(date(2024, 3, 8)));
        // Friday 2024-03-08: one occurrence forward is Monday 2024-03-11.
        let tick = midnight(2024, 3, 8);
        assert_eq!(business_date(&weekdays, tick, 1), Some(date(2024, 3, 11)));
    }
}
