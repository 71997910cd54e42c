//! Promo code and automatic discount models
//!
//! Supported discount types:
//! - Percentage off (e.g., 20% off)
//! - Fixed amount off (e.g., $10 off), currency-bound
//! - Free trial (100% off the evaluated subtotal)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Discount type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "discount_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiscountKind {
    Percentage,
    FixedAmount,
    FreeTrial,
}

/// Policy for combining multiple discounts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "stacking_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StackingMode {
    /// Apply only the first valid discount
    None,
    /// Apply the single largest discount
    Best,
    /// Sum discount amounts, capped at the subtotal
    Additive,
    /// Apply in order, each against the remaining total
    Multiplicative,
}

/// A condition gating a discount. Unknown condition types evaluate to valid
/// so that new host-side conditions do not break older engines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DiscountCondition {
    FirstPurchase(bool),
    MinAmount(i64),
    MinQuantity(i64),
    SpecificPlans(Vec<String>),
    SpecificProducts(Vec<String>),
    CustomerTag(String),
    DateRange {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    },
    #[serde(other)]
    Unknown,
}

/// Promo code entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoCode {
    pub id: Uuid,
    /// Unique code (e.g., "SAVE30")
    pub code: String,
    pub description: Option<String>,

    pub discount_type: DiscountKind,
    /// Percent points for `Percentage`, minor units for `FixedAmount`
    pub discount_value: i64,
    /// Required for `FixedAmount`
    pub currency: Option<String>,

    pub stacking_mode: StackingMode,
    pub conditions: Vec<DiscountCondition>,

    pub max_redemptions: Option<i64>,
    pub current_redemptions: i64,
    pub max_redemptions_per_customer: Option<i64>,

    /// Empty means all plans
    pub applicable_plan_ids: Vec<String>,
    /// Empty means all products
    pub applicable_product_ids: Vec<String>,

    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromoCode {
    /// Redemptions left, if a global cap is set
    pub fn remaining_redemptions(&self) -> Option<i64> {
        self.max_redemptions
            .map(|max| (max - self.current_redemptions).max(0))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining_redemptions(), Some(0))
    }
}

/// Automatic (codeless) discount, applied when its conditions match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomaticDiscount {
    pub id: Uuid,
    pub name: String,

    pub discount_type: DiscountKind,
    pub discount_value: i64,

    pub conditions: Vec<DiscountCondition>,

    /// Higher priority is considered first
    pub priority: i32,
    pub stacking_mode: StackingMode,

    pub active: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create promo code request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePromoCodeRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,

    #[validate(length(max = 500))]
    pub description: Option<String>,

    pub discount_type: DiscountKind,

    #[validate(range(min = 0))]
    pub discount_value: i64,

    pub currency: Option<String>,

    #[serde(default = "default_stacking_mode")]
    pub stacking_mode: StackingMode,

    #[serde(default)]
    pub conditions: Vec<DiscountCondition>,

    pub max_redemptions: Option<i64>,
    pub max_redemptions_per_customer: Option<i64>,

    #[serde(default)]
    pub applicable_plan_ids: Vec<String>,

    #[serde(default)]
    pub applicable_product_ids: Vec<String>,

    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

fn default_stacking_mode() -> StackingMode {
    StackingMode::None
}
