//! Plan and price operations

use uuid::Uuid;
use validator::Validate;

use crate::{
    common::{Page, Pagination},
    models::{BillingInterval, CreatePlanRequest, Plan, Price},
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    pub async fn create_plan(&self, request: CreatePlanRequest) -> Result<Plan> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let now = self.now();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            active: true,
            features: request.features,
            entitlements: request.entitlements,
            limit_defaults: request.limit_defaults,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };

        let plan = self.storage().plans().create(plan).await?;
        self.audit("plan", plan.id, "created", None, serde_json::to_value(&plan).ok())
            .await;
        Ok(plan)
    }

    pub async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.storage()
            .plans()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Plan {} not found", id)))
    }

    pub async fn list_plans(&self, pagination: Pagination, active_only: bool) -> Result<Page<Plan>> {
        self.storage().plans().list(pagination, active_only).await
    }

    pub async fn deactivate_plan(&self, id: Uuid) -> Result<Plan> {
        let mut plan = self.get_plan(id).await?;
        plan.active = false;
        let plan = self.storage().plans().save(plan).await?;
        self.audit("plan", plan.id, "deactivated", None, None).await;
        Ok(plan)
    }

    /// Attach a price to a plan. The currency falls back to the configured
    /// default when empty.
    pub async fn create_price(
        &self,
        plan_id: Uuid,
        currency: Option<String>,
        unit_amount: i64,
        billing_interval: BillingInterval,
        interval_count: i32,
        trial_days: Option<i32>,
    ) -> Result<Price> {
        if unit_amount < 0 {
            return Err(Error::validation("unit_amount must be non-negative"));
        }
        if interval_count < 1 {
            return Err(Error::validation("interval_count must be at least 1"));
        }
        if let Some(days) = trial_days {
            if days < 0 {
                return Err(Error::validation("trial_days must be non-negative"));
            }
        }
        // Plan must exist
        self.get_plan(plan_id).await?;

        let now = self.now();
        let price = Price {
            id: Uuid::new_v4(),
            plan_id,
            currency: currency
                .unwrap_or_else(|| self.config().billing.default_currency.clone()),
            unit_amount,
            billing_interval,
            interval_count,
            trial_days,
            active: true,
            provider_price_ids: Default::default(),
            created_at: now,
            updated_at: now,
        };

        let price = self.storage().prices().create(price).await?;
        self.audit("price", price.id, "created", None, serde_json::to_value(&price).ok())
            .await;
        Ok(price)
    }

    pub async fn get_price(&self, id: Uuid) -> Result<Price> {
        self.storage()
            .prices()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Price {} not found", id)))
    }

    pub async fn list_prices(&self, plan_id: Uuid) -> Result<Vec<Price>> {
        self.storage().prices().list_by_plan(plan_id).await
    }
}
