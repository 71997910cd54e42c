//! Plan and Price models
//!
//! A plan describes what the customer gets (features, entitlement keys,
//! limit defaults); prices attach billing terms to a plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use super::ProviderKind;

/// Billing interval for a price
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "billing_interval", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
    OneTime,
}

impl BillingInterval {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, BillingInterval::OneTime)
    }
}

/// A feature listed on a plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanFeature {
    pub name: String,
    pub included: bool,
}

/// Plan entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,

    pub features: Vec<PlanFeature>,

    /// Entitlement keys granted while a subscription to this plan is active
    pub entitlements: Vec<String>,

    /// limit key -> default max value granted by this plan
    pub limit_defaults: HashMap<String, i64>,

    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Price entity. `unit_amount` is in integer minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub currency: String,
    pub unit_amount: i64,
    pub billing_interval: BillingInterval,
    pub interval_count: i32,
    pub trial_days: Option<i32>,
    pub active: bool,

    /// provider -> provider-side price id
    pub provider_price_ids: HashMap<ProviderKind, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Price {
    /// Whether this price matches a subscription's billing terms
    pub fn matches_terms(&self, interval: BillingInterval, interval_count: i32) -> bool {
        self.billing_interval == interval && self.interval_count == interval_count
    }
}

/// Create plan request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePlanRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[validate(length(max = 1000))]
    pub description: Option<String>,

    #[serde(default)]
    pub features: Vec<PlanFeature>,

    #[serde(default)]
    pub entitlements: Vec<String>,

    #[serde(default)]
    pub limit_defaults: HashMap<String, i64>,

    #[serde(default)]
    pub metadata: serde_json::Value,
}
