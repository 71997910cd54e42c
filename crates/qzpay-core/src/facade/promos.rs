//! Promo code and automatic discount operations
//!
//! Redemption goes through the storage port's serialized counter so the
//! global cap holds under concurrent redemptions.

use uuid::Uuid;
use validator::Validate;

use crate::{
    common::{Page, Pagination},
    discounts::{
        self, CombinationMode, DiscountContext, DiscountResult, PromoValidation,
    },
    models::{
        promo::CreatePromoCodeRequest, AutomaticDiscount, DiscountKind, PromoCode,
    },
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    pub async fn create_promo_code(&self, request: CreatePromoCodeRequest) -> Result<PromoCode> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        if request.discount_type == DiscountKind::FixedAmount && request.currency.is_none() {
            return Err(Error::validation(
                "fixed_amount promo codes require a currency",
            ));
        }
        if request.discount_type == DiscountKind::Percentage
            && !(0..=100).contains(&request.discount_value)
        {
            return Err(Error::validation(
                "percentage discount_value must be between 0 and 100",
            ));
        }

        let now = self.now();
        let promo = PromoCode {
            id: Uuid::new_v4(),
            code: request.code.to_uppercase(),
            description: request.description,
            discount_type: request.discount_type,
            discount_value: request.discount_value,
            currency: request.currency,
            stacking_mode: request.stacking_mode,
            conditions: request.conditions,
            max_redemptions: request.max_redemptions,
            current_redemptions: 0,
            max_redemptions_per_customer: request.max_redemptions_per_customer,
            applicable_plan_ids: request.applicable_plan_ids,
            applicable_product_ids: request.applicable_product_ids,
            valid_from: request.valid_from,
            valid_until: request.valid_until,
            active: true,
            created_at: now,
            updated_at: now,
        };

        let promo = self.storage().promo_codes().create(promo).await?;
        self.audit("promo_code", promo.id, "created", None, serde_json::to_value(&promo).ok())
            .await;
        Ok(promo)
    }

    pub async fn get_promo_code(&self, code: &str) -> Result<PromoCode> {
        self.storage()
            .promo_codes()
            .find_by_code(code)
            .await?
            .ok_or_else(|| Error::not_found(format!("Promo code {} not found", code)))
    }

    pub async fn list_promo_codes(&self, pagination: Pagination) -> Result<Page<PromoCode>> {
        self.storage().promo_codes().list(pagination).await
    }

    pub async fn deactivate_promo_code(&self, code: &str) -> Result<PromoCode> {
        let mut promo = self.get_promo_code(code).await?;
        promo.active = false;
        self.storage().promo_codes().save(promo).await
    }

    /// Validate a promo code against a purchase context without redeeming
    pub async fn validate_promo_code(
        &self,
        code: &str,
        ctx: &DiscountContext,
    ) -> Result<PromoValidation> {
        let promo = self.get_promo_code(code).await?;
        Ok(discounts::validate_promo(&promo, ctx))
    }

    /// Validate and redeem a promo code for a customer. The increment is
    /// serialized per code; redeeming past the cap is a `Conflict`.
    pub async fn redeem_promo_code(
        &self,
        code: &str,
        customer_id: Uuid,
        ctx: &DiscountContext,
    ) -> Result<DiscountResult> {
        let promo = self.get_promo_code(code).await?;

        let validation = discounts::validate_promo(&promo, ctx);
        if !validation.valid {
            return Err(Error::forbidden(
                validation
                    .error
                    .unwrap_or_else(|| "Promo code is not valid".to_string()),
            ));
        }

        let promo = self
            .storage()
            .promo_codes()
            .redeem(promo.id, customer_id)
            .await?;

        self.audit(
            "promo_code",
            promo.id,
            "redeemed",
            None,
            Some(serde_json::json!({ "customer_id": customer_id })),
        )
        .await;

        Ok(discounts::apply_promo_codes(&[promo], ctx))
    }

    /// Preview promo codes against a context, without redeeming
    pub async fn apply_promo_codes(
        &self,
        codes: &[String],
        ctx: &DiscountContext,
    ) -> Result<DiscountResult> {
        let mut promos = Vec::with_capacity(codes.len());
        for code in codes {
            promos.push(self.get_promo_code(code).await?);
        }
        Ok(discounts::apply_promo_codes(&promos, ctx))
    }

    pub async fn create_automatic_discount(
        &self,
        discount: AutomaticDiscount,
    ) -> Result<AutomaticDiscount> {
        self.storage().automatic_discounts().create(discount).await
    }

    /// Combine promo codes with the stored automatic discounts
    pub async fn compute_discounts(
        &self,
        codes: &[String],
        ctx: &DiscountContext,
        mode: CombinationMode,
    ) -> Result<DiscountResult> {
        let mut promos = Vec::with_capacity(codes.len());
        for code in codes {
            promos.push(self.get_promo_code(code).await?);
        }
        let automatic = self.storage().automatic_discounts().list_active().await?;
        Ok(discounts::combine_discounts(&promos, &automatic, ctx, mode))
    }
}
