//! Metrics reports over the stored billing data

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{
    metrics::{self, ChurnReport, RevenueReport},
    models::{Price, Subscription},
    storage::Storage,
    Result,
};

use super::QzPay;

impl QzPay {
    /// MRR totals per currency across active and trialing subscriptions
    pub async fn mrr_report(&self) -> Result<HashMap<String, i64>> {
        let subscriptions = self.active_subscriptions_with_prices().await?;
        let entries: Vec<(&Subscription, i64)> = subscriptions
            .iter()
            .map(|(subscription, price)| (subscription, price.unit_amount))
            .collect();
        metrics::mrr_by_currency(&entries)
    }

    /// Churn over a period
    pub async fn churn_report(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<ChurnReport> {
        let page = self
            .storage()
            .subscriptions()
            .list(crate::common::Pagination::new(100, 0))
            .await?;
        let mut subscriptions = page.data;
        let mut offset = 100;
        let mut has_more = page.has_more;
        while has_more {
            let page = self
                .storage()
                .subscriptions()
                .list(crate::common::Pagination::new(100, offset))
                .await?;
            has_more = page.has_more;
            offset += 100;
            subscriptions.extend(page.data);
        }

        // MRR lookup falls back to zero when a plan has no active price
        let mut price_by_plan: HashMap<uuid::Uuid, i64> = HashMap::new();
        for subscription in &subscriptions {
            if let std::collections::hash_map::Entry::Vacant(entry) =
                price_by_plan.entry(subscription.plan_id)
            {
                let prices = self
                    .storage()
                    .prices()
                    .list_by_plan(subscription.plan_id)
                    .await?;
                entry.insert(prices.iter().find(|p| p.active).map(|p| p.unit_amount).unwrap_or(0));
            }
        }

        Ok(metrics::churn_rate(
            &subscriptions,
            |subscription| {
                let unit_amount = price_by_plan.get(&subscription.plan_id).copied().unwrap_or(0);
                metrics::normalize_monthly(
                    unit_amount,
                    subscription.interval,
                    subscription.interval_count,
                )
                .map(|normalized| normalized * subscription.quantity)
                .unwrap_or(0)
            },
            period_start,
            period_end,
        ))
    }

    /// Revenue over `[from, to)` in one currency
    pub async fn revenue_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        currency: &str,
    ) -> Result<RevenueReport> {
        let payments = self.storage().payments().list_in_period(from, to).await?;
        Ok(metrics::revenue_in_period(&payments, from, to, currency))
    }

    async fn active_subscriptions_with_prices(
        &self,
    ) -> Result<Vec<(Subscription, Price)>> {
        use crate::models::SubscriptionStatus;

        let mut subscriptions = self
            .storage()
            .subscriptions()
            .list_by_status(SubscriptionStatus::Active)
            .await?;
        subscriptions.extend(
            self.storage()
                .subscriptions()
                .list_by_status(SubscriptionStatus::Trialing)
                .await?,
        );

        let mut result = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let prices = self
                .storage()
                .prices()
                .list_by_plan(subscription.plan_id)
                .await?;
            let price = prices
                .iter()
                .find(|p| {
                    p.active
                        && p.matches_terms(subscription.interval, subscription.interval_count)
                })
                .or_else(|| prices.iter().find(|p| p.active))
                .cloned();
            if let Some(price) = price {
                result.push((subscription, price));
            }
        }
        Ok(result)
    }
}
