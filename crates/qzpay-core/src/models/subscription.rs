//! Subscription model for recurring billing
//!
//! The lifecycle engine drives renewals, trial conversions, payment retries
//! and non-payment cancellation over these records. Lifecycle bookkeeping
//! (grace period, retry counters, recovery markers) is stored in typed
//! columns, not a metadata blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use super::{BillingInterval, ProviderKind};

/// Subscription status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Trial period before billing starts
    Trialing,
    /// Subscription is active and billing
    Active,
    /// Renewal failed, grace period running
    PastDue,
    /// Subscription has been canceled
    Canceled,
    /// Subscription is paused temporarily
    Paused,
    /// Grace period exhausted without recovery
    Unpaid,
    /// Awaiting first payment confirmation
    Incomplete,
    /// First payment never completed
    IncompleteExpired,
}

impl SubscriptionStatus {
    /// Statuses that count toward MRR and entitlement access
    pub fn is_active_for_billing(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::IncompleteExpired
        )
    }
}

/// Subscription entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,

    pub status: SubscriptionStatus,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub quantity: i64,

    pub currency: String,

    // Period tracking
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,

    // Trial
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,

    // Cancellation
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancel_reason: Option<String>,

    /// provider -> provider-side subscription id
    pub provider_subscription_ids: HashMap<ProviderKind, String>,

    // Renewal bookkeeping
    pub last_renewal_at: Option<DateTime<Utc>>,
    pub last_renewal_error: Option<String>,
    pub last_payment_id: Option<Uuid>,

    // Grace period / retry bookkeeping
    pub grace_period_started_at: Option<DateTime<Utc>>,
    pub grace_period_ended_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_retry_error: Option<String>,

    // Recovery bookkeeping
    pub recovered_at: Option<DateTime<Utc>>,
    pub recovery_payment_id: Option<Uuid>,

    // Trial conversion bookkeeping
    pub trial_converted_at: Option<DateTime<Utc>>,
    pub first_payment_id: Option<Uuid>,

    pub metadata: serde_json::Value,
    pub livemode: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Clear grace-period and retry state after a successful recovery
    pub fn clear_dunning_state(&mut self) {
        self.grace_period_started_at = None;
        self.grace_period_ended_at = None;
        self.retry_count = 0;
        self.last_retry_at = None;
        self.last_retry_error = None;
    }
}

/// Add-on attached to a subscription with its own quantity and status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionAddOn {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub addon_id: Uuid,
    pub quantity: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create subscription request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub price_id: Option<Uuid>,

    #[validate(range(min = 1))]
    pub quantity: i64,

    /// Overrides the price's trial_days when set
    pub trial_days: Option<i32>,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Update subscription request (partial)
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateSubscriptionRequest {
    #[validate(range(min = 1))]
    pub quantity: Option<i64>,

    pub cancel_at_period_end: Option<bool>,
    pub metadata: Option<serde_json::Value>,
}

/// Cancel subscription request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CancelSubscriptionRequest {
    /// When true, the subscription stays active until the period end
    pub at_period_end: bool,

    #[validate(length(max = 500))]
    pub reason: Option<String>,
}
