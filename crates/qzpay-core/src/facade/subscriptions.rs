//! Subscription operations
//!
//! Creation resolves the price, opens a trial when one applies, and grants
//! the plan's entitlements and limit defaults. Reactivation of a canceled
//! subscription is an explicit host operation; the lifecycle engine never
//! resurrects one.

use chrono::Duration;
use uuid::Uuid;
use validator::Validate;

use crate::{
    common::{Page, Pagination},
    lifecycle::add_billing_interval,
    models::{
        CancelSubscriptionRequest, CreateSubscriptionRequest, EntitlementGrant, GrantSource,
        Price, Subscription, SubscriptionStatus, UpdateSubscriptionRequest,
    },
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    pub async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<Subscription> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let customer = self.get_customer(request.customer_id).await?;
        let plan = self.get_plan(request.plan_id).await?;
        if !plan.active {
            return Err(Error::forbidden(format!("Plan {} is not active", plan.id)));
        }

        let price = match request.price_id {
            Some(price_id) => {
                let price = self.get_price(price_id).await?;
                if price.plan_id != plan.id {
                    return Err(Error::validation(
                        "Price does not belong to the requested plan",
                    ));
                }
                price
            }
            None => self.first_active_price(plan.id).await?,
        };
        if !price.billing_interval.is_recurring() {
            return Err(Error::validation(
                "Subscriptions require a recurring price",
            ));
        }

        let now = self.now();
        let trial_days = request.trial_days.or(price.trial_days).unwrap_or(0);
        let (status, trial_start, trial_end, period_end) = if trial_days > 0 {
            let trial_end = now + Duration::days(trial_days as i64);
            (
                SubscriptionStatus::Trialing,
                Some(now),
                Some(trial_end),
                trial_end,
            )
        } else {
            (
                SubscriptionStatus::Active,
                None,
                None,
                add_billing_interval(now, price.billing_interval, price.interval_count),
            )
        };

        let subscription = Subscription {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            plan_id: plan.id,
            status,
            interval: price.billing_interval,
            interval_count: price.interval_count,
            quantity: request.quantity,
            currency: price.currency.clone(),
            current_period_start: now,
            current_period_end: period_end,
            trial_start,
            trial_end,
            cancel_at: None,
            canceled_at: None,
            cancel_at_period_end: false,
            cancel_reason: None,
            provider_subscription_ids: Default::default(),
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
            metadata: request.metadata,
            livemode: self.livemode(),
            created_at: now,
            updated_at: now,
        };

        let subscription = self.storage().subscriptions().create(subscription).await?;

        // Grant what the plan carries
        for key in &plan.entitlements {
            self.storage()
                .entitlements()
                .upsert_grant(EntitlementGrant {
                    customer_id: customer.id,
                    entitlement_key: key.clone(),
                    granted_at: now,
                    expires_at: None,
                    source: GrantSource::Subscription,
                    source_id: Some(subscription.id.to_string()),
                })
                .await?;
        }
        for (key, max_value) in &plan.limit_defaults {
            self.storage()
                .limits()
                .set_limit(crate::models::CustomerLimit {
                    customer_id: customer.id,
                    limit_key: key.clone(),
                    max_value: *max_value,
                    current_value: 0,
                    reset_at: None,
                    source: GrantSource::Subscription,
                })
                .await?;
        }

        self.audit(
            "subscription",
            subscription.id,
            "created",
            None,
            serde_json::to_value(&subscription).ok(),
        )
        .await;

        Ok(subscription)
    }

    async fn first_active_price(&self, plan_id: Uuid) -> Result<Price> {
        let prices = self.storage().prices().list_by_plan(plan_id).await?;
        prices
            .into_iter()
            .find(|p| p.active)
            .ok_or_else(|| Error::not_found(format!("No active price for plan {}", plan_id)))
    }

    pub async fn get_subscription(&self, id: Uuid) -> Result<Subscription> {
        self.storage()
            .subscriptions()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Subscription {} not found", id)))
    }

    /// The customer's subscription with `status = active`, if any
    pub async fn get_active_subscription(
        &self,
        customer_id: Uuid,
    ) -> Result<Option<Subscription>> {
        self.storage()
            .subscriptions()
            .find_active_by_customer(customer_id)
            .await
    }

    pub async fn list_customer_subscriptions(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<Subscription>> {
        self.storage()
            .subscriptions()
            .list_by_customer(customer_id)
            .await
    }

    pub async fn list_subscriptions(&self, pagination: Pagination) -> Result<Page<Subscription>> {
        self.storage().subscriptions().list(pagination).await
    }

    pub async fn update_subscription(
        &self,
        id: Uuid,
        request: UpdateSubscriptionRequest,
    ) -> Result<Subscription> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let mut subscription = self.get_subscription(id).await?;
        if subscription.status.is_terminal() {
            return Err(Error::validation(
                "Cannot update a canceled subscription",
            ));
        }

        if let Some(quantity) = request.quantity {
            subscription.quantity = quantity;
        }
        if let Some(cancel_at_period_end) = request.cancel_at_period_end {
            subscription.cancel_at_period_end = cancel_at_period_end;
        }
        if let Some(metadata) = request.metadata {
            subscription.metadata = metadata;
        }

        self.storage().subscriptions().save(subscription).await
    }

    /// Cancel immediately or flag for cancellation at the period end
    pub async fn cancel_subscription(
        &self,
        id: Uuid,
        request: CancelSubscriptionRequest,
    ) -> Result<Subscription> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let mut subscription = self.get_subscription(id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Ok(subscription);
        }

        let before = serde_json::to_value(&subscription).ok();
        let now = self.now();

        if request.at_period_end {
            subscription.cancel_at_period_end = true;
            subscription.cancel_at = Some(subscription.current_period_end);
            subscription.cancel_reason = request.reason;
        } else {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.canceled_at = Some(now);
            subscription.cancel_reason = request
                .reason
                .or_else(|| Some("Customer requested".to_string()));
        }

        let subscription = self.storage().subscriptions().save(subscription).await?;
        self.audit(
            "subscription",
            subscription.id,
            "canceled",
            before,
            serde_json::to_value(&subscription).ok(),
        )
        .await;
        Ok(subscription)
    }

    pub async fn pause_subscription(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get_subscription(id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(Error::validation(
                "Only active subscriptions can be paused",
            ));
        }
        subscription.status = SubscriptionStatus::Paused;
        self.storage().subscriptions().save(subscription).await
    }

    pub async fn resume_subscription(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get_subscription(id).await?;
        if subscription.status != SubscriptionStatus::Paused {
            return Err(Error::validation("Subscription is not paused"));
        }
        subscription.status = SubscriptionStatus::Active;
        self.storage().subscriptions().save(subscription).await
    }

    /// Explicit host-side reactivation of a canceled subscription: a fresh
    /// period starting now. The lifecycle engine never does this on its own.
    pub async fn reactivate_subscription(&self, id: Uuid) -> Result<Subscription> {
        let mut subscription = self.get_subscription(id).await?;
        if subscription.status != SubscriptionStatus::Canceled {
            return Err(Error::validation("Subscription is not canceled"));
        }

        let now = self.now();
        subscription.status = SubscriptionStatus::Active;
        subscription.canceled_at = None;
        subscription.cancel_reason = None;
        subscription.cancel_at = None;
        subscription.cancel_at_period_end = false;
        subscription.clear_dunning_state();
        subscription.current_period_start = now;
        subscription.current_period_end = add_billing_interval(
            now,
            subscription.interval,
            subscription.interval_count,
        );

        let subscription = self.storage().subscriptions().save(subscription).await?;
        self.audit("subscription", subscription.id, "reactivated", None, None)
            .await;
        Ok(subscription)
    }
}
