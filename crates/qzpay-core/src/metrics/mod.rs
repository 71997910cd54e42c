//! Metrics engine
//!
//! MRR normalization and breakdown, churn rate and revenue reports. All
//! computation is pure over snapshots the caller loads; results are integer
//! minor units rounded half-away-from-zero. MRR is reported per currency;
//! cross-currency aggregation is the caller's concern.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    models::{BillingInterval, Payment, PaymentStatus, Subscription},
    Error, Result,
};

fn round_minor(value: Decimal) -> i64 {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Normalize a price to its monthly equivalent:
/// day x30, week x30/7, month /count, year /(12*count).
pub fn normalize_monthly(
    unit_amount: i64,
    interval: BillingInterval,
    interval_count: i32,
) -> Result<i64> {
    Ok(round_minor(normalize_monthly_decimal(
        unit_amount,
        interval,
        interval_count,
    )?))
}

fn normalize_monthly_decimal(
    unit_amount: i64,
    interval: BillingInterval,
    interval_count: i32,
) -> Result<Decimal> {
    if interval_count < 1 {
        return Err(Error::validation("interval_count must be at least 1"));
    }

    let amount = Decimal::from(unit_amount);
    let count = Decimal::from(interval_count);

    let normalized = match interval {
        BillingInterval::Day => amount * Decimal::from(30) / count,
        BillingInterval::Week => amount * Decimal::from(30) / (Decimal::from(7) * count),
        BillingInterval::Month => amount / count,
        BillingInterval::Year => amount / (Decimal::from(12) * count),
        BillingInterval::OneTime => {
            return Err(Error::validation("one_time prices have no monthly equivalent"))
        }
    };

    Ok(normalized)
}

/// A subscription's MRR contribution: normalized monthly price times
/// quantity. Only active and trialing subscriptions count.
pub fn subscription_mrr(
    subscription: &Subscription,
    unit_amount: i64,
) -> Result<i64> {
    if !subscription.status.is_active_for_billing() {
        return Ok(0);
    }
    let normalized = normalize_monthly_decimal(
        unit_amount,
        subscription.interval,
        subscription.interval_count,
    )?;
    Ok(round_minor(normalized * Decimal::from(subscription.quantity)))
}

/// Per-currency MRR totals over (subscription, unit_amount) pairs
pub fn mrr_by_currency(entries: &[(&Subscription, i64)]) -> Result<HashMap<String, i64>> {
    let mut totals: HashMap<String, i64> = HashMap::new();
    for (subscription, unit_amount) in entries {
        let mrr = subscription_mrr(subscription, *unit_amount)?;
        if mrr > 0 {
            *totals.entry(subscription.currency.clone()).or_insert(0) += mrr;
        }
    }
    Ok(totals)
}

/// One subscription's state in an MRR snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrrSnapshotEntry {
    pub subscription_id: Uuid,
    /// Status in {active, trialing} at snapshot time
    pub active: bool,
    pub mrr: i64,
}

/// MRR movement between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrrBreakdown {
    pub new: i64,
    pub expansion: i64,
    pub contraction: i64,
    pub churned: i64,
    pub reactivation: i64,
}

/// Classify MRR movement between a previous and current snapshot.
pub fn mrr_breakdown(
    previous: &[MrrSnapshotEntry],
    current: &[MrrSnapshotEntry],
) -> MrrBreakdown {
    let previous_by_id: HashMap<Uuid, &MrrSnapshotEntry> =
        previous.iter().map(|e| (e.subscription_id, e)).collect();
    let current_by_id: HashMap<Uuid, &MrrSnapshotEntry> =
        current.iter().map(|e| (e.subscription_id, e)).collect();

    let mut breakdown = MrrBreakdown::default();

    for entry in current {
        match previous_by_id.get(&entry.subscription_id) {
            None if entry.active => breakdown.new += entry.mrr,
            None => {}
            Some(prev) => {
                if !prev.active && entry.active {
                    breakdown.reactivation += entry.mrr;
                } else if prev.active && entry.active {
                    if entry.mrr > prev.mrr {
                        breakdown.expansion += entry.mrr - prev.mrr;
                    } else if entry.mrr < prev.mrr {
                        breakdown.contraction += prev.mrr - entry.mrr;
                    }
                }
            }
        }
    }

    for entry in previous {
        if !entry.active {
            continue;
        }
        let still_active = current_by_id
            .get(&entry.subscription_id)
            .map(|c| c.active)
            .unwrap_or(false);
        if !still_active {
            breakdown.churned += entry.mrr;
        }
    }

    breakdown
}

/// Churn over a period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChurnReport {
    pub rate_percent: f64,
    pub canceled_count: i64,
    pub active_at_start: i64,
    pub churned_revenue: i64,
}

/// Churn rate: canceled-in-period over active-at-period-start, as a
/// percentage, with the churned subscriptions' MRR summed.
pub fn churn_rate(
    subscriptions: &[Subscription],
    mrr_of: impl Fn(&Subscription) -> i64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> ChurnReport {
    let active_at_start = subscriptions
        .iter()
        .filter(|s| s.created_at <= period_start && s.status.is_active_for_billing())
        .count() as i64;

    let canceled: Vec<&Subscription> = subscriptions
        .iter()
        .filter(|s| {
            s.canceled_at
                .map(|at| at >= period_start && at <= period_end)
                .unwrap_or(false)
        })
        .collect();

    let canceled_count = canceled.len() as i64;
    let churned_revenue = canceled.iter().map(|s| mrr_of(s)).sum();

    let rate_percent = if active_at_start > 0 {
        canceled_count as f64 / active_at_start as f64 * 100.0
    } else {
        0.0
    };

    ChurnReport {
        rate_percent,
        canceled_count,
        active_at_start,
        churned_revenue,
    }
}

/// Revenue over a period, in one currency
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueReport {
    pub total: i64,
    pub recurring: i64,
    pub one_time: i64,
    pub refunded: i64,
    pub net: i64,
}

/// Sum succeeded payments in `[from, to)` in the given currency, split into
/// recurring (has a subscription) and one-time, minus refunds.
pub fn revenue_in_period(
    payments: &[Payment],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    currency: &str,
) -> RevenueReport {
    let mut report = RevenueReport::default();

    for payment in payments {
        if payment.created_at < from || payment.created_at >= to {
            continue;
        }
        if !payment.currency.eq_ignore_ascii_case(currency) {
            continue;
        }

        match payment.status {
            PaymentStatus::Succeeded => {
                report.total += payment.amount;
                if payment.subscription_id.is_some() {
                    report.recurring += payment.amount;
                } else {
                    report.one_time += payment.amount;
                }
            }
            PaymentStatus::Refunded => {
                report.refunded += payment.refunded_amount.max(payment.amount);
            }
            _ => {}
        }
    }

    report.net = report.total - report.refunded;
    report
}
