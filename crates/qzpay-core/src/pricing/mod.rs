//! Volume pricing engine
//!
//! Quantity tiers either discount the whole purchase (flat volume pricing)
//! or price each quantity slice at its own tier's rate (graduated tiered
//! pricing). Tier discounts reuse the discount amount semantics: percentage
//! clamped to [0, 100], fixed amounts never below a zero unit price.

use serde::{Deserialize, Serialize};

use crate::{
    discounts::discount_amount,
    models::DiscountKind,
    Error, Result,
};

/// A quantity tier. `max_quantity` of `None` means unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeTier {
    pub min_quantity: i64,
    pub max_quantity: Option<i64>,
    pub discount_type: DiscountKind,
    pub discount_value: i64,
}

impl VolumeTier {
    pub fn contains(&self, quantity: i64) -> bool {
        quantity >= self.min_quantity
            && self.max_quantity.map_or(true, |max| quantity <= max)
    }

    /// Per-unit price under this tier's discount, never below zero
    fn unit_price(&self, base_price: i64) -> i64 {
        base_price - discount_amount(self.discount_type, self.discount_value, base_price)
    }
}

/// The tier covering `quantity`: the one with the largest `min_quantity`
/// at or below it whose `max_quantity` (if set) admits it.
pub fn find_tier(tiers: &[VolumeTier], quantity: i64) -> Option<&VolumeTier> {
    tiers
        .iter()
        .filter(|tier| tier.contains(quantity))
        .max_by_key(|tier| tier.min_quantity)
}

/// Flat volume pricing: the found tier's discount applies to the whole
/// `quantity * base_price`.
pub fn flat_volume_total(tiers: &[VolumeTier], quantity: i64, base_price: i64) -> Result<i64> {
    if quantity < 0 || base_price < 0 {
        return Err(Error::validation("quantity and base price must be non-negative"));
    }

    let gross = quantity * base_price;
    let total = match find_tier(tiers, quantity) {
        Some(tier) => gross - discount_amount(tier.discount_type, tier.discount_value, gross),
        None => gross,
    };
    Ok(total)
}

/// Graduated tiered pricing: each tier's slice of the total quantity is
/// priced at that tier's discounted unit price, then summed.
pub fn graduated_tiered_total(
    tiers: &[VolumeTier],
    quantity: i64,
    base_price: i64,
) -> Result<i64> {
    if quantity < 0 || base_price < 0 {
        return Err(Error::validation("quantity and base price must be non-negative"));
    }

    let mut ordered: Vec<&VolumeTier> = tiers.iter().collect();
    ordered.sort_by_key(|tier| tier.min_quantity);

    let mut total = 0i64;
    let mut covered = 0i64;

    for tier in ordered {
        if quantity < tier.min_quantity {
            break;
        }
        let upper = tier.max_quantity.unwrap_or(i64::MAX).min(quantity);
        let lower = tier.min_quantity.max(covered + 1);
        if upper < lower {
            continue;
        }
        let slice = upper - lower + 1;
        total += slice * tier.unit_price(base_price);
        covered = upper;
    }

    // Quantity beyond every defined tier is charged at the base price
    if covered < quantity {
        total += (quantity - covered) * base_price;
    }

    Ok(total)
}
