//! Vendor, payout and add-on models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How often a vendor is paid out
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payout_schedule", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutSchedule {
    Weekly,
    Biweekly,
    Monthly,
}

/// Payout status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payout_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Scheduled,
    Processing,
    Paid,
    Failed,
}

/// Vendor entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Commission retained by the platform, in percent
    pub commission_rate: Decimal,
    pub payout_schedule: PayoutSchedule,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vendor {
    /// The vendor's share of a gross amount after platform commission,
    /// rounded to minor units
    pub fn net_payout_amount(&self, gross: i64) -> i64 {
        use rust_decimal::prelude::ToPrimitive;
        use rust_decimal::RoundingStrategy;

        let rate = (Decimal::from(100) - self.commission_rate) / Decimal::from(100);
        (Decimal::from(gross) * rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or(0)
            .max(0)
    }
}

/// A scheduled or completed vendor payout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorPayout {
    pub id: Uuid,
    pub vendor_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub scheduled_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A purchasable extension that can be attached to subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOn {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub unit_amount: i64,
    pub currency: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_net_payout_amount() {
        let vendor = Vendor {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            email: "payouts@acme.test".to_string(),
            commission_rate: dec!(15),
            payout_schedule: PayoutSchedule::Monthly,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(vendor.net_payout_amount(10000), 8500);
        assert_eq!(vendor.net_payout_amount(0), 0);
        // 15% of 333 = 49.95, vendor keeps 283.05 -> 283
        assert_eq!(vendor.net_payout_amount(333), 283);
    }
}
