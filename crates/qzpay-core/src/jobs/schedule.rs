//! Named recurring schedules
//!
//! Cron descriptors for the billing engine's recurring work. Expressions
//! use the six-field form the `cron` crate parses (seconds first). The
//! last-day-of-month schedule is computed directly since standard cron
//! cannot express it.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use super::JobType;

/// Named cron schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleDescriptor {
    EveryMinute,
    Every5Minutes,
    Every15Minutes,
    EveryHour,
    DailyMidnight,
    Daily6am,
    WeeklyMonday,
    MonthlyFirst,
    MonthlyLast,
}

impl ScheduleDescriptor {
    /// The cron expression, where one exists. `MonthlyLast` has none.
    pub fn expression(&self) -> Option<&'static str> {
        match self {
            ScheduleDescriptor::EveryMinute => Some("0 * * * * *"),
            ScheduleDescriptor::Every5Minutes => Some("0 */5 * * * *"),
            ScheduleDescriptor::Every15Minutes => Some("0 */15 * * * *"),
            ScheduleDescriptor::EveryHour => Some("0 0 * * * *"),
            ScheduleDescriptor::DailyMidnight => Some("0 0 0 * * *"),
            ScheduleDescriptor::Daily6am => Some("0 0 6 * * *"),
            ScheduleDescriptor::WeeklyMonday => Some("0 0 0 * * MON"),
            ScheduleDescriptor::MonthlyFirst => Some("0 0 0 1 * *"),
            ScheduleDescriptor::MonthlyLast => None,
        }
    }

    /// Next fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.expression() {
            Some(expression) => {
                let schedule = Schedule::from_str(expression).ok()?;
                schedule.after(&after).next()
            }
            None => Some(next_last_of_month(after)),
        }
    }
}

/// Midnight on the last day of the month, strictly after `after`
fn next_last_of_month(after: DateTime<Utc>) -> DateTime<Utc> {
    let mut year = after.year();
    let mut month = after.month();

    loop {
        let candidate = last_midnight_of_month(year, month);
        if candidate > after {
            return candidate;
        }
        month += 1;
        if month > 12 {
            month = 1;
            year += 1;
        }
    }
}

fn last_midnight_of_month(year: i32, month: u32) -> DateTime<Utc> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .unwrap();
    first_of_next - Duration::days(1)
}

/// The default recurring schedule table: renewals hourly, retries every
/// fifteen minutes, invoice reminders at 6AM, payment-method expiry checks
/// daily, vendor payouts Monday midnight, cleanup on the first of the month.
pub fn default_schedules() -> Vec<(JobType, ScheduleDescriptor)> {
    vec![
        (JobType::SubscriptionRenewal, ScheduleDescriptor::EveryHour),
        (JobType::PaymentRetry, ScheduleDescriptor::Every15Minutes),
        (JobType::InvoiceGeneration, ScheduleDescriptor::Daily6am),
        (
            JobType::PaymentMethodExpiryCheck,
            ScheduleDescriptor::DailyMidnight,
        ),
        (JobType::PayoutProcessing, ScheduleDescriptor::WeeklyMonday),
        (JobType::Cleanup, ScheduleDescriptor::MonthlyFirst),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_expressions_parse() {
        for descriptor in [
            ScheduleDescriptor::EveryMinute,
            ScheduleDescriptor::Every5Minutes,
            ScheduleDescriptor::Every15Minutes,
            ScheduleDescriptor::EveryHour,
            ScheduleDescriptor::DailyMidnight,
            ScheduleDescriptor::Daily6am,
            ScheduleDescriptor::WeeklyMonday,
            ScheduleDescriptor::MonthlyFirst,
        ] {
            let expression = descriptor.expression().unwrap();
            assert!(
                Schedule::from_str(expression).is_ok(),
                "{} does not parse",
                expression
            );
        }
    }

    #[test]
    fn test_hourly_next() {
        let next = ScheduleDescriptor::EveryHour
            .next_after(at(2024, 4, 1, 10, 30))
            .unwrap();
        assert_eq!(next, at(2024, 4, 1, 11, 0));
    }

    #[test]
    fn test_daily_6am_next() {
        let next = ScheduleDescriptor::Daily6am
            .next_after(at(2024, 4, 1, 7, 0))
            .unwrap();
        assert_eq!(next, at(2024, 4, 2, 6, 0));
    }

    #[test]
    fn test_monthly_first_next() {
        let next = ScheduleDescriptor::MonthlyFirst
            .next_after(at(2024, 4, 15, 0, 0))
            .unwrap();
        assert_eq!(next, at(2024, 5, 1, 0, 0));
    }

    #[test]
    fn test_monthly_last_handles_month_lengths() {
        let next = ScheduleDescriptor::MonthlyLast
            .next_after(at(2024, 2, 10, 0, 0))
            .unwrap();
        // 2024 is a leap year
        assert_eq!(next, at(2024, 2, 29, 0, 0));

        let next = ScheduleDescriptor::MonthlyLast
            .next_after(at(2024, 2, 29, 0, 0))
            .unwrap();
        assert_eq!(next, at(2024, 3, 31, 0, 0));

        let next = ScheduleDescriptor::MonthlyLast
            .next_after(at(2023, 12, 31, 5, 0))
            .unwrap();
        assert_eq!(next, at(2024, 1, 31, 0, 0));
    }

    #[test]
    fn test_default_schedule_table() {
        let schedules = default_schedules();
        assert_eq!(schedules.len(), 6);
        assert!(schedules
            .iter()
            .any(|(t, s)| *t == JobType::SubscriptionRenewal
                && *s == ScheduleDescriptor::EveryHour));
        assert!(schedules
            .iter()
            .any(|(t, s)| *t == JobType::PaymentRetry
                && *s == ScheduleDescriptor::Every15Minutes));
    }
}
