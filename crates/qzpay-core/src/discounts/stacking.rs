//! Discount stacking and combination
//!
//! Four stacking modes:
//! - `none`: only the first valid discount applies
//! - `best`: each candidate is evaluated against the original subtotal and
//!   only the largest applies
//! - `additive`: amounts are summed and capped at the subtotal
//! - `multiplicative`: applied in input order, each against the remaining
//!   total
//!
//! Promo codes and automatic discounts combine through
//! `best | promo_first | auto_first`.

use serde::{Deserialize, Serialize};

use crate::models::{AutomaticDiscount, PromoCode, StackingMode};

use super::{
    automatic_discount_applies, discount_amount, validate_promo, AppliedDiscount,
    DiscountCandidate, DiscountContext, DiscountResult, SkippedDiscount,
};

/// How promo-code and automatic discounts combine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMode {
    /// Whichever side yields the larger discount wins
    Best,
    /// Promo against the subtotal, automatic against the reduced total
    PromoFirst,
    /// Automatic against the subtotal, promo against the reduced total
    AutoFirst,
}

fn applied(candidate: &DiscountCandidate, amount: i64) -> AppliedDiscount {
    AppliedDiscount {
        id: candidate.id,
        label: candidate.label.clone(),
        kind: candidate.kind,
        value: candidate.value,
        amount,
    }
}

fn skipped(candidate: &DiscountCandidate, reason: impl Into<String>) -> SkippedDiscount {
    SkippedDiscount {
        id: candidate.id,
        label: candidate.label.clone(),
        reason: reason.into(),
    }
}

/// Apply candidates under an explicit stacking mode
pub fn apply_candidates(
    candidates: &[DiscountCandidate],
    subtotal: i64,
    mode: StackingMode,
) -> DiscountResult {
    let mut result = DiscountResult::unchanged(subtotal);
    if candidates.is_empty() || subtotal <= 0 {
        return result;
    }

    match mode {
        StackingMode::None => {
            let first = &candidates[0];
            let amount = discount_amount(first.kind, first.value, subtotal);
            result.discount_amount = amount;
            result.applied_discounts.push(applied(first, amount));
            for candidate in &candidates[1..] {
                result
                    .skipped_discounts
                    .push(skipped(candidate, "Stacking disabled"));
            }
        }
        StackingMode::Best => {
            let amounts: Vec<i64> = candidates
                .iter()
                .map(|c| discount_amount(c.kind, c.value, subtotal))
                .collect();
            let best_index = amounts
                .iter()
                .enumerate()
                .max_by_key(|(index, amount)| (**amount, std::cmp::Reverse(*index)))
                .map(|(index, _)| index)
                .unwrap_or(0);

            for (index, candidate) in candidates.iter().enumerate() {
                if index == best_index {
                    result.discount_amount = amounts[index];
                    result.applied_discounts.push(applied(candidate, amounts[index]));
                } else {
                    result
                        .skipped_discounts
                        .push(skipped(candidate, "A larger discount was applied"));
                }
            }
        }
        StackingMode::Additive => {
            let mut sum = 0i64;
            for candidate in candidates {
                let amount = discount_amount(candidate.kind, candidate.value, subtotal);
                sum += amount;
                result.applied_discounts.push(applied(candidate, amount));
            }
            result.discount_amount = sum.min(subtotal);
        }
        StackingMode::Multiplicative => {
            let mut remaining = subtotal;
            for candidate in candidates {
                let amount = discount_amount(candidate.kind, candidate.value, remaining);
                remaining -= amount;
                result.applied_discounts.push(applied(candidate, amount));
            }
            result.discount_amount = subtotal - remaining;
        }
    }

    result.final_amount = result.original_amount - result.discount_amount;
    result
}

/// Apply candidates, taking the stacking mode from the first candidate
pub fn apply(candidates: &[DiscountCandidate], subtotal: i64) -> DiscountResult {
    match candidates.first() {
        Some(first) => apply_candidates(candidates, subtotal, first.stacking_mode),
        None => DiscountResult::unchanged(subtotal),
    }
}

/// Validate promo codes against the context, then stack the valid ones.
/// Invalid codes land in `skipped_discounts` with the validation error.
pub fn apply_promo_codes(promos: &[PromoCode], ctx: &DiscountContext) -> DiscountResult {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();

    for promo in promos {
        let validation = validate_promo(promo, ctx);
        if validation.valid {
            valid.push(DiscountCandidate::from(promo));
        } else {
            invalid.push(SkippedDiscount {
                id: promo.id,
                label: promo.code.clone(),
                reason: validation
                    .error
                    .unwrap_or_else(|| "Promo code is not valid".to_string()),
            });
        }
    }

    let mut result = apply(&valid, ctx.subtotal);
    result.skipped_discounts.extend(invalid);
    result
}

/// Filter automatic discounts by activity, validity window and conditions,
/// sort by priority descending, then stack.
pub fn apply_automatic_discounts(
    discounts: &[AutomaticDiscount],
    ctx: &DiscountContext,
) -> DiscountResult {
    let mut applicable: Vec<&AutomaticDiscount> = discounts
        .iter()
        .filter(|d| automatic_discount_applies(d, ctx))
        .collect();
    applicable.sort_by_key(|d| std::cmp::Reverse(d.priority));

    let candidates: Vec<DiscountCandidate> =
        applicable.iter().map(|d| DiscountCandidate::from(*d)).collect();
    apply(&candidates, ctx.subtotal)
}

/// Combine promo-code discounts with automatic discounts
pub fn combine_discounts(
    promos: &[PromoCode],
    automatic: &[AutomaticDiscount],
    ctx: &DiscountContext,
    mode: CombinationMode,
) -> DiscountResult {
    match mode {
        CombinationMode::Best => {
            let promo_result = apply_promo_codes(promos, ctx);
            let auto_result = apply_automatic_discounts(automatic, ctx);
            if auto_result.discount_amount > promo_result.discount_amount {
                auto_result
            } else {
                promo_result
            }
        }
        CombinationMode::PromoFirst => {
            let first = apply_promo_codes(promos, ctx);
            let mut reduced_ctx = ctx.clone();
            reduced_ctx.subtotal = first.final_amount;
            let second = apply_automatic_discounts(automatic, &reduced_ctx);
            merge(ctx.subtotal, first, second)
        }
        CombinationMode::AutoFirst => {
            let first = apply_automatic_discounts(automatic, ctx);
            let mut reduced_ctx = ctx.clone();
            reduced_ctx.subtotal = first.final_amount;
            let second = apply_promo_codes(promos, &reduced_ctx);
            merge(ctx.subtotal, first, second)
        }
    }
}

fn merge(subtotal: i64, first: DiscountResult, second: DiscountResult) -> DiscountResult {
    let discount_amount = (first.discount_amount + second.discount_amount).min(subtotal);
    let mut applied_discounts = first.applied_discounts;
    applied_discounts.extend(second.applied_discounts);
    let mut skipped_discounts = first.skipped_discounts;
    skipped_discounts.extend(second.skipped_discounts);

    DiscountResult {
        original_amount: subtotal,
        discount_amount,
        final_amount: subtotal - discount_amount,
        applied_discounts,
        skipped_discounts,
    }
}
