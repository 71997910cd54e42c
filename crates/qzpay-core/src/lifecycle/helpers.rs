//! Subscription helper functions
//!
//! Free functions over subscription records plus the billing calendar
//! arithmetic the engine advances periods with. Month and year addition
//! clamp to the end of the month (Jan 31 + 1 month = Feb 28/29).

use chrono::{DateTime, Duration, Months, Utc};

use crate::models::{BillingInterval, Subscription, SubscriptionStatus};

/// Advance a timestamp by `count` billing intervals
pub fn add_billing_interval(
    from: DateTime<Utc>,
    interval: BillingInterval,
    count: i32,
) -> DateTime<Utc> {
    let count = count.max(0);
    match interval {
        BillingInterval::Day => from + Duration::days(count as i64),
        BillingInterval::Week => from + Duration::weeks(count as i64),
        BillingInterval::Month => from
            .checked_add_months(Months::new(count as u32))
            .unwrap_or(from),
        BillingInterval::Year => from
            .checked_add_months(Months::new(12 * count as u32))
            .unwrap_or(from),
        BillingInterval::OneTime => from,
    }
}

/// Whether the customer still has access through this subscription.
/// Past-due subscriptions keep access while the grace period runs.
pub fn has_access(
    subscription: &Subscription,
    grace_period_days: i64,
    now: DateTime<Utc>,
) -> bool {
    match subscription.status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => true,
        SubscriptionStatus::PastDue => in_grace_period(subscription, grace_period_days, now),
        _ => false,
    }
}

/// Whether a past-due subscription is still inside its grace window
pub fn in_grace_period(
    subscription: &Subscription,
    grace_period_days: i64,
    now: DateTime<Utc>,
) -> bool {
    subscription
        .grace_period_started_at
        .map(|started| now < started + Duration::days(grace_period_days))
        .unwrap_or(false)
}

/// Days until the current period ends; negative when already past
pub fn days_until_renewal(subscription: &Subscription, now: DateTime<Utc>) -> i64 {
    (subscription.current_period_end - now).num_days()
}

/// Whether the subscription is in an unexpired trial
pub fn is_in_trial(subscription: &Subscription, now: DateTime<Utc>) -> bool {
    subscription.status == SubscriptionStatus::Trialing
        && subscription.trial_end.map(|end| now < end).unwrap_or(false)
}

/// When the next payment retry is due, if any retries remain
pub fn next_retry_at(
    subscription: &Subscription,
    retry_intervals: &[i64],
) -> Option<DateTime<Utc>> {
    let started = subscription.grace_period_started_at?;
    let interval_days = *retry_intervals.get(subscription.retry_count as usize)?;
    let last = subscription.last_retry_at.unwrap_or(started);
    Some(last + Duration::days(interval_days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn subscription(status: SubscriptionStatus) -> Subscription {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Subscription {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status,
            interval: BillingInterval::Month,
            interval_count: 1,
            quantity: 1,
            currency: "USD".to_string(),
            current_period_start: now,
            current_period_end: now + Duration::days(30),
            trial_start: None,
            trial_end: None,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: false,
            cancel_reason: None,
            provider_subscription_ids: HashMap::new(),
            last_renewal_at: None,
            last_renewal_error: None,
            last_payment_id: None,
            grace_period_started_at: None,
            grace_period_ended_at: None,
            retry_count: 0,
            last_retry_at: None,
            last_retry_error: None,
            recovered_at: None,
            recovery_payment_id: None,
            trial_converted_at: None,
            first_payment_id: None,
            metadata: serde_json::Value::Null,
            livemode: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_month_addition_clamps_to_end_of_month() {
        let jan31 = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let feb = add_billing_interval(jan31, BillingInterval::Month, 1);
        // 2024 is a leap year
        assert_eq!(feb, Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap());

        let jan31_2023 = Utc.with_ymd_and_hms(2023, 1, 31, 12, 0, 0).unwrap();
        let feb_2023 = add_billing_interval(jan31_2023, BillingInterval::Month, 1);
        assert_eq!(feb_2023, Utc.with_ymd_and_hms(2023, 2, 28, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_arithmetic() {
        let base = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(
            add_billing_interval(base, BillingInterval::Day, 10),
            base + Duration::days(10)
        );
        assert_eq!(
            add_billing_interval(base, BillingInterval::Week, 2),
            base + Duration::weeks(2)
        );
        assert_eq!(
            add_billing_interval(base, BillingInterval::Year, 1),
            Utc.with_ymd_and_hms(2025, 3, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            add_billing_interval(base, BillingInterval::OneTime, 1),
            base
        );
    }

    #[test]
    fn test_has_access_through_grace_period() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        assert!(has_access(&subscription(SubscriptionStatus::Active), 7, now));
        assert!(has_access(&subscription(SubscriptionStatus::Trialing), 7, now));
        assert!(!has_access(&subscription(SubscriptionStatus::Canceled), 7, now));

        let mut past_due = subscription(SubscriptionStatus::PastDue);
        past_due.grace_period_started_at = Some(now - Duration::days(3));
        assert!(has_access(&past_due, 7, now));

        past_due.grace_period_started_at = Some(now - Duration::days(8));
        assert!(!has_access(&past_due, 7, now));
    }

    #[test]
    fn test_days_until_renewal() {
        let sub = subscription(SubscriptionStatus::Active);
        let now = sub.current_period_end - Duration::days(5);
        assert_eq!(days_until_renewal(&sub, now), 5);

        let after = sub.current_period_end + Duration::days(2);
        assert_eq!(days_until_renewal(&sub, after), -2);
    }

    #[test]
    fn test_next_retry_at_uses_grace_start_then_last_retry() {
        let mut sub = subscription(SubscriptionStatus::PastDue);
        let started = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        sub.grace_period_started_at = Some(started);
        let intervals = vec![1, 3, 5];

        // First retry: one day after grace start
        assert_eq!(
            next_retry_at(&sub, &intervals),
            Some(started + Duration::days(1))
        );

        // After one failed retry, the next is three days after it
        sub.retry_count = 1;
        sub.last_retry_at = Some(started + Duration::days(1));
        assert_eq!(
            next_retry_at(&sub, &intervals),
            Some(started + Duration::days(4))
        );

        // Retries exhausted
        sub.retry_count = 3;
        assert_eq!(next_retry_at(&sub, &intervals), None);
    }
}
