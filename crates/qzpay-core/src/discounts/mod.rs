//! Discount engine
//!
//! Pure functions over promo codes and automatic discounts: validation,
//! condition evaluation, amount computation and stacking. All monetary
//! amounts are integers in minor currency units; a computed discount never
//! exceeds the subtotal it was computed from.

pub mod stacking;

pub use stacking::{
    apply_automatic_discounts, apply_candidates, apply_promo_codes, combine_discounts,
    CombinationMode,
};

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AutomaticDiscount, DiscountCondition, DiscountKind, PromoCode, StackingMode};

/// Everything a discount decision can look at
#[derive(Debug, Clone)]
pub struct DiscountContext {
    pub currency: String,
    /// Minor units
    pub subtotal: i64,
    pub quantity: i64,
    pub plan_id: Option<String>,
    pub product_ids: Vec<String>,
    pub customer_tags: Vec<String>,
    pub is_first_purchase: bool,
    pub current_date: DateTime<Utc>,
}

impl DiscountContext {
    pub fn new(currency: impl Into<String>, subtotal: i64, now: DateTime<Utc>) -> Self {
        Self {
            currency: currency.into(),
            subtotal,
            quantity: 1,
            plan_id: None,
            product_ids: Vec::new(),
            customer_tags: Vec::new(),
            is_first_purchase: false,
            current_date: now,
        }
    }
}

/// Outcome of promo validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl PromoValidation {
    fn ok() -> Self {
        Self { valid: true, error: None }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// A discount applied to the subtotal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedDiscount {
    pub id: Uuid,
    pub label: String,
    pub kind: DiscountKind,
    pub value: i64,
    pub amount: i64,
}

/// A discount that was considered but not applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDiscount {
    pub id: Uuid,
    pub label: String,
    pub reason: String,
}

/// Result of applying a set of discounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscountResult {
    pub original_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub applied_discounts: Vec<AppliedDiscount>,
    pub skipped_discounts: Vec<SkippedDiscount>,
}

impl DiscountResult {
    pub fn unchanged(subtotal: i64) -> Self {
        Self {
            original_amount: subtotal,
            discount_amount: 0,
            final_amount: subtotal,
            applied_discounts: Vec::new(),
            skipped_discounts: Vec::new(),
        }
    }
}

/// A discount flattened for stacking, whatever its origin
#[derive(Debug, Clone)]
pub struct DiscountCandidate {
    pub id: Uuid,
    pub label: String,
    pub kind: DiscountKind,
    pub value: i64,
    pub stacking_mode: StackingMode,
}

impl From<&PromoCode> for DiscountCandidate {
    fn from(promo: &PromoCode) -> Self {
        Self {
            id: promo.id,
            label: promo.code.clone(),
            kind: promo.discount_type,
            value: promo.discount_value,
            stacking_mode: promo.stacking_mode,
        }
    }
}

impl From<&AutomaticDiscount> for DiscountCandidate {
    fn from(discount: &AutomaticDiscount) -> Self {
        Self {
            id: discount.id,
            label: discount.name.clone(),
            kind: discount.discount_type,
            value: discount.discount_value,
            stacking_mode: discount.stacking_mode,
        }
    }
}

/// Compute a single discount amount against a subtotal. The result is
/// always within `[0, subtotal]`.
pub fn discount_amount(kind: DiscountKind, value: i64, subtotal: i64) -> i64 {
    if subtotal <= 0 {
        return 0;
    }
    match kind {
        DiscountKind::Percentage => {
            let percent = value.clamp(0, 100);
            (Decimal::from(subtotal) * Decimal::from(percent) / Decimal::from(100))
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
                .to_i64()
                .unwrap_or(0)
                .min(subtotal)
        }
        DiscountKind::FixedAmount => value.clamp(0, subtotal),
        DiscountKind::FreeTrial => subtotal,
    }
}

/// Evaluate one condition against the context. Unknown conditions are valid.
pub fn evaluate_condition(condition: &DiscountCondition, ctx: &DiscountContext) -> bool {
    match condition {
        DiscountCondition::FirstPurchase(required) => ctx.is_first_purchase == *required,
        DiscountCondition::MinAmount(min) => ctx.subtotal >= *min,
        DiscountCondition::MinQuantity(min) => ctx.quantity >= *min,
        DiscountCondition::SpecificPlans(plans) => ctx
            .plan_id
            .as_ref()
            .map(|plan| plans.contains(plan))
            .unwrap_or(false),
        DiscountCondition::SpecificProducts(products) => {
            ctx.product_ids.iter().any(|p| products.contains(p))
        }
        DiscountCondition::CustomerTag(tag) => ctx.customer_tags.contains(tag),
        DiscountCondition::DateRange { start, end } => {
            if let Some(start) = start {
                if ctx.current_date < *start {
                    return false;
                }
            }
            if let Some(end) = end {
                if ctx.current_date > *end {
                    return false;
                }
            }
            true
        }
        DiscountCondition::Unknown => true,
    }
}

/// Validate a promo code against a purchase context.
///
/// Checks, in order: active flag, validity window, redemption cap, currency
/// match for fixed amounts, plan and product applicability, then every
/// attached condition.
pub fn validate_promo(promo: &PromoCode, ctx: &DiscountContext) -> PromoValidation {
    if !promo.active {
        return PromoValidation::fail("Promo code is not active");
    }

    if let Some(valid_until) = promo.valid_until {
        if ctx.current_date > valid_until {
            return PromoValidation::fail("Promo code has expired");
        }
    }

    if let Some(valid_from) = promo.valid_from {
        if ctx.current_date < valid_from {
            return PromoValidation::fail("Promo code is not yet valid");
        }
    }

    if let Some(max) = promo.max_redemptions {
        if promo.current_redemptions >= max {
            return PromoValidation::fail("Promo code has reached its redemption limit");
        }
    }

    if promo.discount_type == DiscountKind::FixedAmount {
        match &promo.currency {
            Some(currency) if currency.eq_ignore_ascii_case(&ctx.currency) => {}
            _ => return PromoValidation::fail("Promo code currency does not match"),
        }
    }

    if !promo.applicable_plan_ids.is_empty() {
        let matches = ctx
            .plan_id
            .as_ref()
            .map(|plan| promo.applicable_plan_ids.contains(plan))
            .unwrap_or(false);
        if !matches {
            return PromoValidation::fail("Promo code does not apply to this plan");
        }
    }

    if !promo.applicable_product_ids.is_empty() {
        let intersects = ctx
            .product_ids
            .iter()
            .any(|p| promo.applicable_product_ids.contains(p));
        if !intersects {
            return PromoValidation::fail("Promo code does not apply to these products");
        }
    }

    for condition in &promo.conditions {
        if !evaluate_condition(condition, ctx) {
            return PromoValidation::fail("Promo code conditions are not met");
        }
    }

    PromoValidation::ok()
}

/// Whether an automatic discount applies to the context
pub fn automatic_discount_applies(discount: &AutomaticDiscount, ctx: &DiscountContext) -> bool {
    if !discount.active {
        return false;
    }
    if let Some(valid_from) = discount.valid_from {
        if ctx.current_date < valid_from {
            return false;
        }
    }
    if let Some(valid_until) = discount.valid_until {
        if ctx.current_date > valid_until {
            return false;
        }
    }
    discount
        .conditions
        .iter()
        .all(|condition| evaluate_condition(condition, ctx))
}

/// Human-readable description of a promo: label, plan scope, expiry
pub fn format_description(promo: &PromoCode) -> String {
    let mut description = match promo.discount_type {
        DiscountKind::Percentage => format!("{}% off", promo.discount_value.clamp(0, 100)),
        DiscountKind::FixedAmount => {
            let currency = promo.currency.as_deref().unwrap_or("");
            format!(
                "{}.{:02} {} off",
                promo.discount_value / 100,
                (promo.discount_value % 100).abs(),
                currency
            )
            .trim_end()
            .to_string()
        }
        DiscountKind::FreeTrial => "Free trial".to_string(),
    };

    if !promo.applicable_plan_ids.is_empty() {
        description.push_str(" on selected plans");
    }
    if let Some(valid_until) = promo.valid_until {
        description.push_str(&format!(" (until {})", valid_until.format("%Y-%m-%d")));
    }

    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(subtotal: i64) -> DiscountContext {
        DiscountContext::new(
            "USD",
            subtotal,
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        )
    }

    fn promo(kind: DiscountKind, value: i64) -> PromoCode {
        PromoCode {
            id: Uuid::new_v4(),
            code: "TEST".to_string(),
            description: None,
            discount_type: kind,
            discount_value: value,
            currency: matches!(kind, DiscountKind::FixedAmount).then(|| "USD".to_string()),
            stacking_mode: StackingMode::None,
            conditions: vec![],
            max_redemptions: None,
            current_redemptions: 0,
            max_redemptions_per_customer: None,
            applicable_plan_ids: vec![],
            applicable_product_ids: vec![],
            valid_from: None,
            valid_until: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_percentage_amount_clamped() {
        assert_eq!(discount_amount(DiscountKind::Percentage, 20, 10000), 2000);
        // Over 100% clamps to the subtotal
        assert_eq!(discount_amount(DiscountKind::Percentage, 150, 10000), 10000);
        // Negative clamps to zero
        assert_eq!(discount_amount(DiscountKind::Percentage, -5, 10000), 0);
        // Half-cent rounds away from zero: 25% of 102 = 25.5 -> 26
        assert_eq!(discount_amount(DiscountKind::Percentage, 25, 102), 26);
    }

    #[test]
    fn test_fixed_amount_clamped() {
        assert_eq!(discount_amount(DiscountKind::FixedAmount, 500, 10000), 500);
        assert_eq!(discount_amount(DiscountKind::FixedAmount, 20000, 10000), 10000);
        assert_eq!(discount_amount(DiscountKind::FixedAmount, -100, 10000), 0);
    }

    #[test]
    fn test_free_trial_is_full_subtotal() {
        assert_eq!(discount_amount(DiscountKind::FreeTrial, 0, 4200), 4200);
    }

    #[test]
    fn test_amount_never_exceeds_subtotal() {
        for value in [0, 1, 50, 99, 100, 500] {
            for subtotal in [0, 1, 99, 100, 12345] {
                for kind in [
                    DiscountKind::Percentage,
                    DiscountKind::FixedAmount,
                    DiscountKind::FreeTrial,
                ] {
                    let amount = discount_amount(kind, value, subtotal);
                    assert!(amount >= 0 && amount <= subtotal);
                }
            }
        }
    }

    #[test]
    fn test_validation_order_and_messages() {
        let context = ctx(10000);

        let mut inactive = promo(DiscountKind::Percentage, 10);
        inactive.active = false;
        assert!(!validate_promo(&inactive, &context).valid);

        let mut expired = promo(DiscountKind::Percentage, 10);
        expired.valid_until = Some(context.current_date - chrono::Duration::days(1));
        let result = validate_promo(&expired, &context);
        assert_eq!(result.error.as_deref(), Some("Promo code has expired"));

        let mut not_yet = promo(DiscountKind::Percentage, 10);
        not_yet.valid_from = Some(context.current_date + chrono::Duration::days(1));
        assert!(!validate_promo(&not_yet, &context).valid);

        let mut exhausted = promo(DiscountKind::Percentage, 10);
        exhausted.max_redemptions = Some(3);
        exhausted.current_redemptions = 3;
        assert!(!validate_promo(&exhausted, &context).valid);
    }

    #[test]
    fn test_fixed_amount_requires_currency_match() {
        let mut context = ctx(10000);
        let fixed = promo(DiscountKind::FixedAmount, 500);
        assert!(validate_promo(&fixed, &context).valid);

        context.currency = "EUR".to_string();
        assert!(!validate_promo(&fixed, &context).valid);
    }

    #[test]
    fn test_plan_scoping() {
        let mut context = ctx(10000);
        let mut scoped = promo(DiscountKind::Percentage, 10);
        scoped.applicable_plan_ids = vec!["pro".to_string()];

        assert!(!validate_promo(&scoped, &context).valid);

        context.plan_id = Some("pro".to_string());
        assert!(validate_promo(&scoped, &context).valid);
    }

    #[test]
    fn test_conditions_gate_validity() {
        let mut context = ctx(10000);
        let mut conditional = promo(DiscountKind::Percentage, 10);
        conditional.conditions = vec![
            DiscountCondition::MinAmount(5000),
            DiscountCondition::CustomerTag("beta".to_string()),
        ];

        assert!(!validate_promo(&conditional, &context).valid);

        context.customer_tags.push("beta".to_string());
        assert!(validate_promo(&conditional, &context).valid);

        context.subtotal = 4000;
        assert!(!validate_promo(&conditional, &context).valid);
    }

    #[test]
    fn test_unknown_condition_is_valid() {
        let context = ctx(10000);
        let mut with_unknown = promo(DiscountKind::Percentage, 10);
        with_unknown.conditions = vec![DiscountCondition::Unknown];
        assert!(validate_promo(&with_unknown, &context).valid);
    }

    #[test]
    fn test_date_range_condition() {
        let context = ctx(10000);
        let in_range = DiscountCondition::DateRange {
            start: Some(context.current_date - chrono::Duration::days(1)),
            end: Some(context.current_date + chrono::Duration::days(1)),
        };
        assert!(evaluate_condition(&in_range, &context));

        let past = DiscountCondition::DateRange {
            start: None,
            end: Some(context.current_date - chrono::Duration::days(1)),
        };
        assert!(!evaluate_condition(&past, &context));
    }

    #[test]
    fn test_description_formatting() {
        let mut percent = promo(DiscountKind::Percentage, 20);
        percent.applicable_plan_ids = vec!["pro".to_string()];
        assert_eq!(format_description(&percent), "20% off on selected plans");

        let fixed = promo(DiscountKind::FixedAmount, 1050);
        assert_eq!(format_description(&fixed), "10.50 USD off");
    }
}
