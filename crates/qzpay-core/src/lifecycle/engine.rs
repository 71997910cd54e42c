//! Lifecycle engine phases
//!
//! One `run` performs four phases over the subscription table: renewals,
//! trial conversions, payment retries and non-payment cancellations. Every
//! external payment call carries an idempotency key derived from the
//! subscription, period and attempt so a crashed run reconciles on the next
//! tick. State is written before events fire.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::BillingConfig,
    events::{BillingEvent, BillingEventType, EventEmitter},
    models::{Invoice, InvoiceLine, PaymentMethod, Price, Subscription, SubscriptionStatus},
    storage::Storage,
    Error, Result,
};

use super::helpers::add_billing_interval;

/// Why a charge is being made
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChargeType {
    Renewal,
    TrialConversion,
    Retry,
}

impl ChargeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeType::Renewal => "renewal",
            ChargeType::TrialConversion => "trial_conversion",
            ChargeType::Retry => "retry",
        }
    }
}

/// A charge the engine asks the host to make
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub customer_id: Uuid,
    pub subscription_id: Uuid,
    pub payment_method_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub charge_type: ChargeType,
    pub idempotency_key: String,
}

/// Outcome of a charge. `success: false` is a decline, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeOutcome {
    pub success: bool,
    pub payment_id: Option<Uuid>,
    pub error: Option<String>,
}

/// Host-supplied payment callback
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn process(&self, request: ChargeRequest) -> Result<ChargeOutcome>;
}

/// Host-supplied default payment method lookup
#[async_trait]
pub trait PaymentMethodResolver: Send + Sync {
    async fn default_for(&self, customer_id: Uuid) -> Result<Option<PaymentMethod>>;
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub grace_period_days: i64,
    /// Ordered days between retries; its length bounds the retry count
    pub retry_intervals: Vec<i64>,
    /// Days before trial end to attempt conversion; 0 converts at trial end
    pub trial_conversion_days: i64,
    pub livemode: bool,
}

impl From<&BillingConfig> for LifecycleConfig {
    fn from(config: &BillingConfig) -> Self {
        Self {
            grace_period_days: config.grace_period_days,
            retry_intervals: config.retry_intervals.clone(),
            trial_conversion_days: config.trial_conversion_days,
            livemode: config.livemode,
        }
    }
}

/// Per-subscription outcome inside a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionOutcome {
    pub subscription_id: Uuid,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Result of one phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseResult {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// True when the phase stopped early on its deadline; the counts cover
    /// whatever was processed before it
    pub timed_out: bool,
    pub details: Vec<SubscriptionOutcome>,
}

impl PhaseResult {
    fn record_success(&mut self, subscription_id: Uuid) {
        self.processed += 1;
        self.succeeded += 1;
        self.details.push(SubscriptionOutcome {
            subscription_id,
            succeeded: true,
            error: None,
        });
    }

    fn record_failure(&mut self, subscription_id: Uuid, error: impl Into<String>) {
        self.processed += 1;
        self.failed += 1;
        self.details.push(SubscriptionOutcome {
            subscription_id,
            succeeded: false,
            error: Some(error.into()),
        });
    }
}

/// Result of a full engine run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LifecycleRunResult {
    pub renewals: PhaseResult,
    pub trial_conversions: PhaseResult,
    pub retries: PhaseResult,
    pub cancellations: PhaseResult,
}

/// The subscription lifecycle engine
pub struct LifecycleEngine {
    storage: Arc<dyn Storage>,
    payments: Arc<dyn PaymentProcessor>,
    payment_methods: Arc<dyn PaymentMethodResolver>,
    events: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
}

impl LifecycleEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        payments: Arc<dyn PaymentProcessor>,
        payment_methods: Arc<dyn PaymentMethodResolver>,
        events: Arc<EventEmitter>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            storage,
            payments,
            payment_methods,
            events,
            clock,
            config,
        }
    }

    /// Run all four phases. They scan independently; a per-subscription
    /// failure is recorded and the scan continues. Only systemic storage
    /// failures propagate.
    pub async fn run(&self) -> Result<LifecycleRunResult> {
        self.run_with_deadline(None).await
    }

    /// Run with a deadline. Phases that exceed it return partial results
    /// with `timed_out` set; in-flight payment calls are never aborted.
    pub async fn run_with_deadline(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<LifecycleRunResult> {
        let (renewals, trial_conversions, retries, cancellations) = tokio::join!(
            self.process_renewals(deadline),
            self.process_trial_conversions(deadline),
            self.process_retries(deadline),
            self.process_cancellations(deadline),
        );

        Ok(LifecycleRunResult {
            renewals: renewals?,
            trial_conversions: trial_conversions?,
            retries: retries?,
            cancellations: cancellations?,
        })
    }

    fn deadline_hit(&self, deadline: Option<DateTime<Utc>>) -> bool {
        deadline.map_or(false, |d| self.clock.now() >= d)
    }

    fn emit(&self, event: BillingEvent) {
        self.events.emit(&event);
    }

    /// Resolve the price a subscription renews at: match by billing terms,
    /// fall back to the plan's first active price.
    async fn resolve_price(&self, subscription: &Subscription) -> Result<Price> {
        let prices = self.storage.prices().list_by_plan(subscription.plan_id).await?;
        let matching = prices
            .iter()
            .find(|p| {
                p.active && p.matches_terms(subscription.interval, subscription.interval_count)
            })
            .or_else(|| prices.iter().find(|p| p.active))
            .cloned();
        matching.ok_or_else(|| {
            Error::not_found(format!(
                "No active price for plan {}",
                subscription.plan_id
            ))
        })
    }

    async fn resolve_payment_method(&self, customer_id: Uuid) -> Result<PaymentMethod> {
        self.payment_methods
            .default_for(customer_id)
            .await?
            .ok_or_else(|| Error::not_found("No default payment method"))
    }

    async fn charge(
        &self,
        subscription: &Subscription,
        charge_type: ChargeType,
        idempotency_key: String,
    ) -> Result<(i64, ChargeOutcome)> {
        let payment_method = self.resolve_payment_method(subscription.customer_id).await?;
        let price = self.resolve_price(subscription).await?;
        let amount = price.unit_amount * subscription.quantity;

        let outcome = self
            .payments
            .process(ChargeRequest {
                customer_id: subscription.customer_id,
                subscription_id: subscription.id,
                payment_method_id: payment_method.id,
                amount,
                currency: price.currency,
                charge_type,
                idempotency_key,
            })
            .await?;

        Ok((amount, outcome))
    }

    /// Atomically persist a subscription update together with its invoice
    async fn persist_with_invoice(
        &self,
        subscription: Subscription,
        invoice: Invoice,
    ) -> Result<()> {
        self.storage
            .transaction(Box::new(move |store| {
                Box::pin(async move {
                    store.subscriptions().save(subscription).await?;
                    store.invoices().create(invoice).await?;
                    Ok(())
                })
            }))
            .await
    }

    async fn build_paid_invoice(
        &self,
        subscription: &Subscription,
        description: String,
        amount: i64,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<Invoice> {
        let now = self.clock.now();
        let id = Uuid::new_v4();
        let number = self.storage.invoices().next_number().await?;

        let line = InvoiceLine::new(id, description, subscription.quantity, amount / subscription.quantity.max(1))
            .with_period(period_start, period_end);

        let mut invoice = Invoice::open(
            id,
            subscription.customer_id,
            Some(subscription.id),
            number,
            subscription.currency.clone(),
            vec![line],
            0,
            0,
            now,
        )?;
        invoice.period_start = Some(period_start);
        invoice.period_end = Some(period_end);
        invoice.livemode = self.config.livemode;
        invoice.apply_payment(invoice.total, now)?;
        Ok(invoice)
    }

    // --- Renewal phase ---

    /// Renew active subscriptions whose period has ended. A declined
    /// payment moves the subscription to past_due and opens its grace
    /// period; it never propagates as an error.
    pub async fn process_renewals(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<PhaseResult> {
        let now = self.clock.now();
        let due = self.storage.subscriptions().due_for_renewal(now).await?;
        let mut result = PhaseResult::default();

        for subscription in due {
            if self.deadline_hit(deadline) {
                result.timed_out = true;
                break;
            }

            let id = subscription.id;
            match self.renew_one(subscription).await {
                Ok(()) => result.record_success(id),
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "renewal failed");
                    result.record_failure(id, e.to_string());
                }
            }
        }

        info!(
            processed = result.processed,
            succeeded = result.succeeded,
            failed = result.failed,
            "renewal phase complete"
        );
        Ok(result)
    }

    async fn renew_one(&self, subscription: Subscription) -> Result<()> {
        let now = self.clock.now();
        let idempotency_key = format!(
            "renewal:{}:{}",
            subscription.id,
            subscription.current_period_end.timestamp()
        );

        let charge_result = self
            .charge(&subscription, ChargeType::Renewal, idempotency_key)
            .await;

        match charge_result {
            Ok((amount, outcome)) if outcome.success => {
                let old_end = subscription.current_period_end;
                let new_end = add_billing_interval(
                    old_end,
                    subscription.interval,
                    subscription.interval_count,
                );

                let mut updated = subscription.clone();
                updated.status = SubscriptionStatus::Active;
                updated.current_period_start = old_end;
                updated.current_period_end = new_end;
                updated.last_renewal_at = Some(now);
                updated.last_renewal_error = None;
                updated.last_payment_id = outcome.payment_id;

                let invoice = self
                    .build_paid_invoice(
                        &updated,
                        format!("Subscription renewal - {}", subscription.plan_id),
                        amount,
                        old_end,
                        new_end,
                    )
                    .await?;

                self.persist_with_invoice(updated.clone(), invoice).await?;

                self.emit(
                    BillingEvent::new(BillingEventType::SubscriptionRenewed, now)
                        .with_subscription(updated.id)
                        .with_customer(updated.customer_id)
                        .with_data(serde_json::json!({
                            "amount": amount,
                            "currency": updated.currency,
                            "period_start": old_end,
                            "period_end": new_end,
                            "payment_id": outcome.payment_id,
                        })),
                );
                Ok(())
            }
            Ok((_, outcome)) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "Payment was declined".to_string());
                self.enter_grace_period(subscription, &message).await?;
                Err(Error::payment_declined("renewal_failed", message))
            }
            Err(e) => {
                self.enter_grace_period(subscription, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn enter_grace_period(
        &self,
        subscription: Subscription,
        message: &str,
    ) -> Result<()> {
        let now = self.clock.now();

        let mut updated = subscription;
        updated.status = SubscriptionStatus::PastDue;
        updated.grace_period_started_at = Some(now);
        updated.grace_period_ended_at = None;
        updated.last_renewal_at = Some(now);
        updated.last_renewal_error = Some(message.to_string());
        updated.retry_count = 0;
        updated.last_retry_at = None;
        updated.last_retry_error = None;

        let updated = self.storage.subscriptions().save(updated).await?;

        self.emit(
            BillingEvent::new(BillingEventType::SubscriptionRenewalFailed, now)
                .with_subscription(updated.id)
                .with_customer(updated.customer_id)
                .with_data(serde_json::json!({ "error": message })),
        );
        self.emit(
            BillingEvent::new(BillingEventType::SubscriptionEnteredGracePeriod, now)
                .with_subscription(updated.id)
                .with_customer(updated.customer_id)
                .with_data(serde_json::json!({
                    "grace_period_days": self.config.grace_period_days,
                })),
        );
        Ok(())
    }

    // --- Trial conversion phase ---

    /// Convert trials whose end falls inside the notice window. A failed
    /// conversion payment cancels the subscription.
    pub async fn process_trial_conversions(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<PhaseResult> {
        let now = self.clock.now();
        let trialing = self
            .storage
            .subscriptions()
            .list_by_status(SubscriptionStatus::Trialing)
            .await?;
        let mut result = PhaseResult::default();

        for subscription in trialing {
            let Some(trial_end) = subscription.trial_end else {
                continue;
            };
            let eligible = if self.config.trial_conversion_days == 0 {
                now >= trial_end
            } else {
                trial_end - now <= Duration::days(self.config.trial_conversion_days)
            };
            if !eligible {
                continue;
            }

            if self.deadline_hit(deadline) {
                result.timed_out = true;
                break;
            }

            let id = subscription.id;
            match self.convert_one(subscription).await {
                Ok(()) => result.record_success(id),
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "trial conversion failed");
                    result.record_failure(id, e.to_string());
                }
            }
        }

        Ok(result)
    }

    async fn convert_one(&self, subscription: Subscription) -> Result<()> {
        let now = self.clock.now();
        let trial_end_ts = subscription
            .trial_end
            .map(|t| t.timestamp())
            .unwrap_or_default();
        let idempotency_key = format!("trial:{}:{}", subscription.id, trial_end_ts);

        let charge_result = self
            .charge(&subscription, ChargeType::TrialConversion, idempotency_key)
            .await;

        match charge_result {
            Ok((amount, outcome)) if outcome.success => {
                let new_end = add_billing_interval(
                    now,
                    subscription.interval,
                    subscription.interval_count,
                );

                let mut updated = subscription.clone();
                updated.status = SubscriptionStatus::Active;
                updated.current_period_start = now;
                updated.current_period_end = new_end;
                updated.trial_converted_at = Some(now);
                updated.first_payment_id = outcome.payment_id;
                updated.last_payment_id = outcome.payment_id;

                let invoice = self
                    .build_paid_invoice(
                        &updated,
                        format!("Trial conversion - {}", subscription.plan_id),
                        amount,
                        now,
                        new_end,
                    )
                    .await?;

                self.persist_with_invoice(updated.clone(), invoice).await?;

                self.emit(
                    BillingEvent::new(BillingEventType::SubscriptionTrialConverted, now)
                        .with_subscription(updated.id)
                        .with_customer(updated.customer_id)
                        .with_data(serde_json::json!({
                            "amount": amount,
                            "payment_id": outcome.payment_id,
                        })),
                );
                Ok(())
            }
            Ok((_, outcome)) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "Payment was declined".to_string());
                self.cancel_failed_trial(subscription, &message).await?;
                Err(Error::payment_declined("trial_conversion_failed", message))
            }
            Err(e) => {
                self.cancel_failed_trial(subscription, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn cancel_failed_trial(
        &self,
        subscription: Subscription,
        message: &str,
    ) -> Result<()> {
        let now = self.clock.now();

        let mut updated = subscription;
        updated.status = SubscriptionStatus::Canceled;
        updated.canceled_at = Some(now);
        updated.cancel_reason = Some("Trial conversion payment failed".to_string());

        let updated = self.storage.subscriptions().save(updated).await?;

        self.emit(
            BillingEvent::new(BillingEventType::SubscriptionTrialConversionFailed, now)
                .with_subscription(updated.id)
                .with_customer(updated.customer_id)
                .with_data(serde_json::json!({ "error": message })),
        );
        Ok(())
    }

    // --- Retry phase ---

    /// Retry past-due subscriptions whose next retry is due. Success
    /// recovers the subscription; failure advances the retry counter.
    /// Cancellation is the cancellation phase's job, never this one's.
    pub async fn process_retries(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<PhaseResult> {
        let now = self.clock.now();
        let past_due = self
            .storage
            .subscriptions()
            .list_by_status(SubscriptionStatus::PastDue)
            .await?;
        let mut result = PhaseResult::default();

        for subscription in past_due {
            let Some(grace_started) = subscription.grace_period_started_at else {
                continue;
            };
            let index = subscription.retry_count as usize;
            let Some(interval_days) = self.config.retry_intervals.get(index).copied() else {
                // Retries exhausted
                continue;
            };
            let last = subscription.last_retry_at.unwrap_or(grace_started);
            if now < last + Duration::days(interval_days) {
                continue;
            }

            if self.deadline_hit(deadline) {
                result.timed_out = true;
                break;
            }

            let id = subscription.id;
            match self.retry_one(subscription).await {
                Ok(()) => result.record_success(id),
                Err(e) => {
                    warn!(subscription_id = %id, error = %e, "payment retry failed");
                    result.record_failure(id, e.to_string());
                }
            }
        }

        Ok(result)
    }

    async fn retry_one(&self, subscription: Subscription) -> Result<()> {
        let now = self.clock.now();
        let idempotency_key = format!(
            "retry:{}:{}:{}",
            subscription.id,
            subscription.current_period_end.timestamp(),
            subscription.retry_count
        );

        let charge_result = self
            .charge(&subscription, ChargeType::Retry, idempotency_key)
            .await;

        match charge_result {
            Ok((amount, outcome)) if outcome.success => {
                let old_end = subscription.current_period_end;
                let new_end = add_billing_interval(
                    old_end,
                    subscription.interval,
                    subscription.interval_count,
                );

                let mut updated = subscription.clone();
                updated.status = SubscriptionStatus::Active;
                updated.current_period_start = old_end;
                updated.current_period_end = new_end;
                updated.clear_dunning_state();
                updated.recovered_at = Some(now);
                updated.recovery_payment_id = outcome.payment_id;
                updated.last_payment_id = outcome.payment_id;

                let invoice = self
                    .build_paid_invoice(
                        &updated,
                        format!("Subscription renewal - {}", subscription.plan_id),
                        amount,
                        old_end,
                        new_end,
                    )
                    .await?;

                self.persist_with_invoice(updated.clone(), invoice).await?;

                info!(subscription_id = %updated.id, "subscription recovered");
                self.emit(
                    BillingEvent::new(BillingEventType::SubscriptionRetrySucceeded, now)
                        .with_subscription(updated.id)
                        .with_customer(updated.customer_id)
                        .with_data(serde_json::json!({
                            "amount": amount,
                            "payment_id": outcome.payment_id,
                        })),
                );
                Ok(())
            }
            Ok((_, outcome)) => {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "Payment was declined".to_string());
                self.record_failed_retry(subscription, &message).await?;
                Err(Error::payment_declined("retry_failed", message))
            }
            Err(e) => {
                self.record_failed_retry(subscription, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn record_failed_retry(
        &self,
        subscription: Subscription,
        message: &str,
    ) -> Result<()> {
        let now = self.clock.now();

        let mut updated = subscription;
        updated.retry_count += 1;
        updated.last_retry_at = Some(now);
        updated.last_retry_error = Some(message.to_string());

        let updated = self.storage.subscriptions().save(updated).await?;

        let attempts = self.config.retry_intervals.len() as i32;
        if updated.retry_count < attempts {
            let next_interval = self.config.retry_intervals[updated.retry_count as usize];
            self.emit(
                BillingEvent::new(BillingEventType::SubscriptionRetryScheduled, now)
                    .with_subscription(updated.id)
                    .with_customer(updated.customer_id)
                    .with_data(serde_json::json!({
                        "retry_count": updated.retry_count,
                        "next_retry_interval_days": next_interval,
                        "error": message,
                    })),
            );
        } else {
            self.emit(
                BillingEvent::new(BillingEventType::SubscriptionRetryFailed, now)
                    .with_subscription(updated.id)
                    .with_customer(updated.customer_id)
                    .with_data(serde_json::json!({
                        "retry_count": updated.retry_count,
                        "max_retries_reached": true,
                        "error": message,
                    })),
            );
        }
        Ok(())
    }

    // --- Cancellation phase ---

    /// Cancel past-due subscriptions whose grace period has expired with no
    /// retries left.
    pub async fn process_cancellations(
        &self,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<PhaseResult> {
        let now = self.clock.now();
        let past_due = self
            .storage
            .subscriptions()
            .list_by_status(SubscriptionStatus::PastDue)
            .await?;
        let mut result = PhaseResult::default();

        for subscription in past_due {
            let Some(grace_started) = subscription.grace_period_started_at else {
                continue;
            };
            let grace_expired =
                grace_started + Duration::days(self.config.grace_period_days) <= now;
            let retries_exhausted =
                subscription.retry_count as usize >= self.config.retry_intervals.len();
            if !(grace_expired && retries_exhausted) {
                continue;
            }

            if self.deadline_hit(deadline) {
                result.timed_out = true;
                break;
            }

            let id = subscription.id;
            match self.cancel_nonpayment(subscription).await {
                Ok(()) => result.record_success(id),
                Err(e) => {
                    error!(subscription_id = %id, error = %e, "non-payment cancellation failed");
                    result.record_failure(id, e.to_string());
                }
            }
        }

        Ok(result)
    }

    async fn cancel_nonpayment(&self, subscription: Subscription) -> Result<()> {
        let now = self.clock.now();

        let mut updated = subscription;
        updated.status = SubscriptionStatus::Canceled;
        updated.canceled_at = Some(now);
        updated.cancel_reason = Some("Payment failed - grace period expired".to_string());
        updated.grace_period_ended_at = Some(now);

        let updated = self.storage.subscriptions().save(updated).await?;

        warn!(subscription_id = %updated.id, "subscription canceled for non-payment");
        self.emit(
            BillingEvent::new(BillingEventType::SubscriptionCanceledNonpayment, now)
                .with_subscription(updated.id)
                .with_customer(updated.customer_id)
                .with_data(serde_json::json!({
                    "retry_count": updated.retry_count,
                    "grace_period_days": self.config.grace_period_days,
                })),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::{BillingInterval, PaymentMethodKind, PaymentMethodStatus, Plan, PaymentMethod};
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Payment processor scripted by a success flag
    struct ScriptedProcessor {
        succeed: AtomicBool,
        requests: Mutex<Vec<ChargeRequest>>,
    }

    impl ScriptedProcessor {
        fn new(succeed: bool) -> Self {
            Self {
                succeed: AtomicBool::new(succeed),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn set_succeed(&self, succeed: bool) {
            self.succeed.store(succeed, Ordering::SeqCst);
        }

        fn requests(&self) -> Vec<ChargeRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentProcessor for ScriptedProcessor {
        async fn process(&self, request: ChargeRequest) -> Result<ChargeOutcome> {
            self.requests.lock().unwrap().push(request);
            if self.succeed.load(Ordering::SeqCst) {
                Ok(ChargeOutcome {
                    success: true,
                    payment_id: Some(Uuid::new_v4()),
                    error: None,
                })
            } else {
                Ok(ChargeOutcome {
                    success: false,
                    payment_id: None,
                    error: Some("card_declined".to_string()),
                })
            }
        }
    }

    struct StorageResolver {
        storage: Arc<MemoryStorage>,
    }

    #[async_trait]
    impl PaymentMethodResolver for StorageResolver {
        async fn default_for(&self, customer_id: Uuid) -> Result<Option<PaymentMethod>> {
            self.storage
                .payment_methods()
                .default_for_customer(customer_id)
                .await
        }
    }

    struct Harness {
        engine: LifecycleEngine,
        storage: Arc<MemoryStorage>,
        processor: Arc<ScriptedProcessor>,
        clock: Arc<FixedClock>,
        events: Arc<EventEmitter>,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn harness(succeed: bool) -> Harness {
        let clock = Arc::new(FixedClock::new(start_time()));
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        let processor = Arc::new(ScriptedProcessor::new(succeed));
        let events = Arc::new(EventEmitter::new());

        let engine = LifecycleEngine::new(
            storage.clone(),
            processor.clone(),
            Arc::new(StorageResolver {
                storage: storage.clone(),
            }),
            events.clone(),
            clock.clone(),
            LifecycleConfig {
                grace_period_days: 7,
                retry_intervals: vec![1, 3, 5],
                trial_conversion_days: 0,
                livemode: false,
            },
        );

        Harness {
            engine,
            storage,
            processor,
            clock,
            events,
        }
    }

    async fn seed_plan_and_price(harness: &Harness) -> Uuid {
        let now = harness.clock.now();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "basic".to_string(),
            description: None,
            active: true,
            features: vec![],
            entitlements: vec![],
            limit_defaults: HashMap::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        let plan_id = plan.id;
        harness.storage.plans().create(plan).await.unwrap();

        let price = Price {
            id: Uuid::new_v4(),
            plan_id,
            currency: "USD".to_string(),
            unit_amount: 2500,
            billing_interval: BillingInterval::Month,
            interval_count: 1,
            trial_days: None,
            active: true,
            provider_price_ids: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        harness.storage.prices().create(price).await.unwrap();
        plan_id
    }

    async fn seed_customer_with_method(harness: &Harness) -> Uuid {
        let now = harness.clock.now();
        let customer_id = Uuid::new_v4();
        let method = PaymentMethod {
            id: Uuid::new_v4(),
            customer_id,
            kind: PaymentMethodKind::Card,
            status: PaymentMethodStatus::Active,
            is_default: true,
            card: None,
            bank_account: None,
            billing_details: None,
            provider_method_ids: HashMap::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        };
        harness.storage.payment_methods().create(method).await.unwrap();
        customer_id
    }

    fn base_subscription(
        customer_id: Uuid,
        plan_id: Uuid,
        status: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            customer_id,
            plan_id,
            status,
            interval: BillingInterval::Month,
            interval_count: 1,
            quantity: 2,
            currency: "USD".to_string(),
            current_period_start: now - Duration::days(30),
            current_period_end: now,
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
            created_at: now - Duration::days(30),
            updated_at: now - Duration::days(30),
        }
    }

    fn captured_events(events: &Arc<EventEmitter>, event_type: BillingEventType) -> Arc<Mutex<Vec<BillingEvent>>> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_clone = captured.clone();
        events.on(event_type, move |event| {
            captured_clone.lock().unwrap().push(event.clone());
        });
        captured
    }

    #[tokio::test]
    async fn test_renewal_success_advances_period_and_invoices() {
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Active, now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let renewed = captured_events(&harness.events, BillingEventType::SubscriptionRenewed);

        let result = harness.engine.process_renewals(None).await.unwrap();
        assert_eq!(result.processed, 1);
        assert_eq!(result.succeeded, 1);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_start, now);
        assert_eq!(
            after.current_period_end,
            add_billing_interval(now, BillingInterval::Month, 1)
        );
        assert!(after.last_renewal_at.is_some());
        assert!(after.last_payment_id.is_some());

        // quantity 2 * 2500
        let requests = harness.processor.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount, 5000);
        assert_eq!(requests[0].charge_type, ChargeType::Renewal);
        assert!(requests[0].idempotency_key.starts_with("renewal:"));

        let invoices = harness
            .storage
            .invoices()
            .list_by_subscription(sub_id)
            .await
            .unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].total, 5000);
        assert!(invoices[0].invariants_hold());
        assert!(invoices[0]
            .lines[0]
            .description
            .starts_with("Subscription renewal - "));

        assert_eq!(renewed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_failure_enters_grace_period() {
        let harness = harness(false);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Active, now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let failed = captured_events(&harness.events, BillingEventType::SubscriptionRenewalFailed);
        let grace = captured_events(&harness.events, BillingEventType::SubscriptionEnteredGracePeriod);

        let result = harness.engine.process_renewals(None).await.unwrap();
        assert_eq!(result.failed, 1);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::PastDue);
        assert_eq!(after.grace_period_started_at, Some(now));
        assert_eq!(after.retry_count, 0);
        assert!(after.last_renewal_error.is_some());

        assert_eq!(failed.lock().unwrap().len(), 1);
        assert_eq!(grace.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_payment_method_fails_renewal() {
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let now = harness.clock.now();

        // Customer without any payment method
        let sub = base_subscription(Uuid::new_v4(), plan_id, SubscriptionStatus::Active, now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let result = harness.engine.process_renewals(None).await.unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.details[0]
            .error
            .as_deref()
            .unwrap()
            .contains("payment method"));

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::PastDue);
        assert!(harness.processor.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_not_renewed() {
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Active, now);
        sub.cancel_at_period_end = true;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let result = harness.engine.process_renewals(None).await.unwrap();
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_retry_not_due_is_skipped() {
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::PastDue, now);
        sub.grace_period_started_at = Some(now);
        sub.retry_count = 0;
        harness.storage.subscriptions().create(sub).await.unwrap();

        // First retry is due one day after grace start; not yet
        let result = harness.engine.process_retries(None).await.unwrap();
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_retry_recovery_seeded_scenario() {
        // past_due with retry_count=1, last_retry_at=T; at T + intervals[1]=3
        // days, the retry fires and succeeds
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::PastDue, now);
        let old_period_end = sub.current_period_end;
        sub.grace_period_started_at = Some(now - Duration::days(1));
        sub.retry_count = 1;
        sub.last_retry_at = Some(now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let recovered = captured_events(&harness.events, BillingEventType::SubscriptionRetrySucceeded);

        harness.clock.advance(Duration::days(3));
        let result = harness.engine.process_retries(None).await.unwrap();
        assert_eq!(result.succeeded, 1);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(
            after.current_period_end,
            add_billing_interval(old_period_end, BillingInterval::Month, 1)
        );
        assert!(after.recovered_at.is_some());
        assert!(after.recovery_payment_id.is_some());
        assert_eq!(after.retry_count, 0);
        assert!(after.grace_period_started_at.is_none());

        assert_eq!(recovered.lock().unwrap().len(), 1);

        let requests = harness.processor.requests();
        assert_eq!(requests[0].charge_type, ChargeType::Retry);
    }

    #[tokio::test]
    async fn test_retry_failure_schedules_next_then_exhausts() {
        let harness = harness(false);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::PastDue, now);
        sub.grace_period_started_at = Some(now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let scheduled = captured_events(&harness.events, BillingEventType::SubscriptionRetryScheduled);
        let exhausted = captured_events(&harness.events, BillingEventType::SubscriptionRetryFailed);

        // Walk through all three retries: due at +1, then +3, then +5 days
        for advance in [1, 3, 5] {
            harness.clock.advance(Duration::days(advance));
            let result = harness.engine.process_retries(None).await.unwrap();
            assert_eq!(result.processed, 1, "retry at +{} days", advance);
        }

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::PastDue);
        assert_eq!(after.retry_count, 3);

        assert_eq!(scheduled.lock().unwrap().len(), 2);
        let exhausted_events = exhausted.lock().unwrap();
        assert_eq!(exhausted_events.len(), 1);
        assert_eq!(
            exhausted_events[0].data["max_retries_reached"],
            serde_json::json!(true)
        );

        // A further tick runs no more retries
        harness.clock.advance(Duration::days(10));
        let result = harness.engine.process_retries(None).await.unwrap();
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_grace_period_expiry_cancels_seeded_scenario() {
        // Renewal fails at T; at T + 7 days with retries [1,3,5] exhausted,
        // the cancellation phase cancels with the exact reason string
        let harness = harness(false);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Active, now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let canceled = captured_events(&harness.events, BillingEventType::SubscriptionCanceledNonpayment);

        // Renewal fails, grace period opens
        harness.engine.process_renewals(None).await.unwrap();

        // Retries at +1, +3, +5 days all fail
        for advance in [1, 3, 5] {
            harness.clock.advance(Duration::days(advance));
            harness.engine.run().await.unwrap();
        }

        // Exhaustion is observed by the next tick: grace (7 days) expired
        // and all three retries burned
        harness.clock.advance(Duration::hours(1));
        harness.engine.run().await.unwrap();

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Canceled);
        assert_eq!(
            after.cancel_reason.as_deref(),
            Some("Payment failed - grace period expired")
        );
        assert!(after.grace_period_ended_at.is_some());
        assert!(after.canceled_at.is_some());
        assert_eq!(canceled.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_grace_not_expired_keeps_past_due() {
        let harness = harness(false);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::PastDue, now);
        sub.grace_period_started_at = Some(now);
        sub.retry_count = 3; // exhausted, but grace still running
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let result = harness.engine.process_cancellations(None).await.unwrap();
        assert_eq!(result.processed, 0);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn test_trial_conversion_at_trial_end() {
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Trialing, now);
        sub.trial_start = Some(now - Duration::days(14));
        sub.trial_end = Some(now - Duration::hours(1));
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let converted = captured_events(&harness.events, BillingEventType::SubscriptionTrialConverted);

        let result = harness.engine.process_trial_conversions(None).await.unwrap();
        assert_eq!(result.succeeded, 1);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert_eq!(after.current_period_start, now);
        assert!(after.trial_converted_at.is_some());
        assert!(after.first_payment_id.is_some());
        assert_eq!(converted.lock().unwrap().len(), 1);

        let requests = harness.processor.requests();
        assert_eq!(requests[0].charge_type, ChargeType::TrialConversion);
    }

    #[tokio::test]
    async fn test_trial_not_due_yet_with_zero_window() {
        let harness = harness(true);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Trialing, now);
        sub.trial_end = Some(now + Duration::days(3));
        harness.storage.subscriptions().create(sub).await.unwrap();

        // trial_conversion_days = 0: convert only once the trial has ended
        let result = harness.engine.process_trial_conversions(None).await.unwrap();
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_trial_conversion_failure_cancels() {
        let harness = harness(false);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::Trialing, now);
        sub.trial_end = Some(now - Duration::hours(1));
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        let failed = captured_events(&harness.events, BillingEventType::SubscriptionTrialConversionFailed);

        let result = harness.engine.process_trial_conversions(None).await.unwrap();
        assert_eq!(result.failed, 1);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Canceled);
        assert_eq!(
            after.cancel_reason.as_deref(),
            Some("Trial conversion payment failed")
        );
        assert_eq!(failed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_after_one_failed_retry() {
        let harness = harness(false);
        let plan_id = seed_plan_and_price(&harness).await;
        let customer_id = seed_customer_with_method(&harness).await;
        let now = harness.clock.now();

        let mut sub = base_subscription(customer_id, plan_id, SubscriptionStatus::PastDue, now);
        sub.grace_period_started_at = Some(now);
        let sub_id = sub.id;
        harness.storage.subscriptions().create(sub).await.unwrap();

        // First retry fails
        harness.clock.advance(Duration::days(1));
        harness.engine.process_retries(None).await.unwrap();

        // Customer fixes their card; second retry succeeds
        harness.processor.set_succeed(true);
        harness.clock.advance(Duration::days(3));
        let result = harness.engine.process_retries(None).await.unwrap();
        assert_eq!(result.succeeded, 1);

        let after = harness
            .storage
            .subscriptions()
            .find_by_id(sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, SubscriptionStatus::Active);
        assert!(after.last_retry_error.is_none());

        // The subscription never re-enters the retry scan
        harness.clock.advance(Duration::days(30));
        let result = harness.engine.process_retries(None).await.unwrap();
        assert_eq!(result.processed, 0);
    }
}
