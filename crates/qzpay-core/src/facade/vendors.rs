//! Vendor and payout operations

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    common::{Page, Pagination},
    models::{AddOn, PayoutStatus, SubscriptionAddOn, Vendor, VendorPayout},
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    pub async fn create_vendor(&self, vendor: Vendor) -> Result<Vendor> {
        if vendor.commission_rate < rust_decimal::Decimal::ZERO
            || vendor.commission_rate > rust_decimal::Decimal::from(100)
        {
            return Err(Error::validation(
                "commission_rate must be between 0 and 100",
            ));
        }
        self.storage().vendors().create(vendor).await
    }

    pub async fn get_vendor(&self, id: Uuid) -> Result<Vendor> {
        self.storage()
            .vendors()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Vendor {} not found", id)))
    }

    pub async fn list_vendors(&self, pagination: Pagination) -> Result<Page<Vendor>> {
        self.storage().vendors().list(pagination).await
    }

    /// Schedule a payout for the vendor's share of a gross amount, net of
    /// platform commission
    pub async fn schedule_vendor_payout(
        &self,
        vendor_id: Uuid,
        gross_amount: i64,
        currency: Option<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<VendorPayout> {
        if gross_amount <= 0 {
            return Err(Error::validation("gross_amount must be positive"));
        }
        let vendor = self.get_vendor(vendor_id).await?;
        if !vendor.active {
            return Err(Error::forbidden(format!("Vendor {} is not active", vendor_id)));
        }

        let payout = VendorPayout {
            id: Uuid::new_v4(),
            vendor_id,
            amount: vendor.net_payout_amount(gross_amount),
            currency: currency
                .unwrap_or_else(|| self.config().billing.default_currency.clone()),
            status: PayoutStatus::Scheduled,
            scheduled_at,
            paid_at: None,
            created_at: self.now(),
        };

        let payout = self.storage().payouts().create(payout).await?;
        self.audit("vendor_payout", payout.id, "scheduled", None, serde_json::to_value(&payout).ok())
            .await;
        Ok(payout)
    }

    pub async fn list_due_payouts(&self) -> Result<Vec<VendorPayout>> {
        self.storage().payouts().list_due(self.now()).await
    }

    pub async fn list_vendor_payouts(&self, vendor_id: Uuid) -> Result<Vec<VendorPayout>> {
        self.storage().payouts().list_by_vendor(vendor_id).await
    }

    pub async fn mark_payout_paid(&self, payout_id: Uuid) -> Result<VendorPayout> {
        let mut payout = self
            .storage()
            .payouts()
            .find_by_id(payout_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Payout {} not found", payout_id)))?;

        if payout.status == PayoutStatus::Paid {
            return Ok(payout);
        }
        payout.status = PayoutStatus::Paid;
        payout.paid_at = Some(self.now());
        self.storage().payouts().save(payout).await
    }

    // --- Add-ons ---

    pub async fn create_addon(&self, addon: AddOn) -> Result<AddOn> {
        if addon.unit_amount < 0 {
            return Err(Error::validation("unit_amount must be non-negative"));
        }
        self.storage().addons().create(addon).await
    }

    pub async fn list_addons(&self) -> Result<Vec<AddOn>> {
        self.storage().addons().list_active().await
    }

    /// Attach an add-on to a subscription with its own quantity
    pub async fn attach_addon(
        &self,
        subscription_id: Uuid,
        addon_id: Uuid,
        quantity: i64,
    ) -> Result<SubscriptionAddOn> {
        if quantity < 1 {
            return Err(Error::validation("quantity must be at least 1"));
        }
        self.get_subscription(subscription_id).await?;
        let addon = self
            .storage()
            .addons()
            .find_by_id(addon_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Add-on {} not found", addon_id)))?;
        if !addon.active {
            return Err(Error::forbidden(format!("Add-on {} is not active", addon_id)));
        }

        let now = self.now();
        self.storage()
            .subscription_addons()
            .attach(SubscriptionAddOn {
                id: Uuid::new_v4(),
                subscription_id,
                addon_id,
                quantity,
                active: true,
                created_at: now,
                updated_at: now,
            })
            .await
    }

    pub async fn list_subscription_addons(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionAddOn>> {
        self.storage()
            .subscription_addons()
            .list_by_subscription(subscription_id)
            .await
    }

    pub async fn detach_addon(&self, subscription_addon_id: Uuid) -> Result<()> {
        let removed = self
            .storage()
            .subscription_addons()
            .detach(subscription_addon_id)
            .await?;
        if !removed {
            return Err(Error::not_found(format!(
                "Subscription add-on {} not found",
                subscription_addon_id
            )));
        }
        Ok(())
    }
}
