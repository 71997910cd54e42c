//! Entitlement, limit and usage operations

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        CustomerLimit, EntitlementDefinition, EntitlementGrant, GrantSource, LimitDefinition,
        UsageAction, UsageRecord,
    },
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    // --- Entitlements ---

    pub async fn define_entitlement(
        &self,
        key: impl Into<String>,
        name: impl Into<String>,
        description: Option<String>,
    ) -> Result<EntitlementDefinition> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::validation("entitlement key must not be empty"));
        }
        self.storage()
            .entitlements()
            .define(EntitlementDefinition {
                key,
                name: name.into(),
                description,
                created_at: self.now(),
            })
            .await
    }

    /// Grant an entitlement. Re-granting only ever extends: the stored
    /// expiry becomes the later of the two, and no expiry beats any expiry.
    pub async fn grant_entitlement(
        &self,
        customer_id: Uuid,
        key: &str,
        expires_at: Option<DateTime<Utc>>,
        source: GrantSource,
        source_id: Option<String>,
    ) -> Result<EntitlementGrant> {
        if self
            .storage()
            .entitlements()
            .find_definition(key)
            .await?
            .is_none()
        {
            return Err(Error::not_found(format!("Entitlement {} is not defined", key)));
        }

        let grant = self
            .storage()
            .entitlements()
            .upsert_grant(EntitlementGrant {
                customer_id,
                entitlement_key: key.to_string(),
                granted_at: self.now(),
                expires_at,
                source,
                source_id,
            })
            .await?;

        self.audit(
            "entitlement",
            format!("{}:{}", customer_id, key),
            "granted",
            None,
            serde_json::to_value(&grant).ok(),
        )
        .await;

        Ok(grant)
    }

    pub async fn revoke_entitlement(&self, customer_id: Uuid, key: &str) -> Result<()> {
        let removed = self.storage().entitlements().revoke(customer_id, key).await?;
        if !removed {
            return Err(Error::not_found(format!(
                "Customer {} has no grant for {}",
                customer_id, key
            )));
        }
        self.audit(
            "entitlement",
            format!("{}:{}", customer_id, key),
            "revoked",
            None,
            None,
        )
        .await;
        Ok(())
    }

    /// Whether the customer currently holds an unexpired grant
    pub async fn check_entitlement(&self, customer_id: Uuid, key: &str) -> Result<bool> {
        let grant = self.storage().entitlements().find_grant(customer_id, key).await?;
        Ok(grant.map(|g| g.is_active(self.now())).unwrap_or(false))
    }

    pub async fn list_entitlements(&self, customer_id: Uuid) -> Result<Vec<EntitlementGrant>> {
        self.storage().entitlements().list_grants(customer_id).await
    }

    // --- Limits ---

    pub async fn define_limit(
        &self,
        key: impl Into<String>,
        name: impl Into<String>,
        default_value: i64,
    ) -> Result<LimitDefinition> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::validation("limit key must not be empty"));
        }
        if default_value < 0 {
            return Err(Error::validation("default_value must be non-negative"));
        }
        self.storage()
            .limits()
            .define(LimitDefinition {
                key,
                name: name.into(),
                default_value,
                created_at: self.now(),
            })
            .await
    }

    pub async fn set_customer_limit(
        &self,
        customer_id: Uuid,
        key: &str,
        max_value: i64,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<CustomerLimit> {
        if max_value < 0 {
            return Err(Error::validation("max_value must be non-negative"));
        }

        let existing = self.storage().limits().find_limit(customer_id, key).await?;
        let current_value = existing.map(|l| l.current_value).unwrap_or(0);

        self.storage()
            .limits()
            .set_limit(CustomerLimit {
                customer_id,
                limit_key: key.to_string(),
                max_value,
                current_value,
                reset_at,
                source: GrantSource::Manual,
            })
            .await
    }

    /// `allowed = current_value < max_value`. Missing limits fall back to
    /// the definition's default quota.
    pub async fn check_limit(&self, customer_id: Uuid, key: &str) -> Result<bool> {
        match self.storage().limits().find_limit(customer_id, key).await? {
            Some(limit) => Ok(limit.is_allowed()),
            None => {
                let definition = self
                    .storage()
                    .limits()
                    .find_definition(key)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("Limit {} is not defined", key)))?;
                Ok(definition.default_value > 0)
            }
        }
    }

    /// Consume quota; `Forbidden` once the limit is exhausted
    pub async fn consume_limit(
        &self,
        customer_id: Uuid,
        key: &str,
        quantity: i64,
    ) -> Result<CustomerLimit> {
        self.storage()
            .limits()
            .try_consume(customer_id, key, quantity)
            .await
    }

    pub async fn reset_limit(&self, customer_id: Uuid, key: &str) -> Result<CustomerLimit> {
        self.storage().limits().set_current(customer_id, key, 0).await
    }

    pub async fn list_limits(&self, customer_id: Uuid) -> Result<Vec<CustomerLimit>> {
        self.storage().limits().list_limits(customer_id).await
    }

    // --- Usage ---

    /// Record metered usage against a subscription and mirror it into the
    /// customer's limit counter.
    pub async fn record_usage(
        &self,
        subscription_id: Uuid,
        metric_name: &str,
        action: UsageAction,
        quantity: i64,
    ) -> Result<UsageRecord> {
        if quantity < 0 {
            return Err(Error::validation("quantity must be non-negative"));
        }

        let subscription = self.get_subscription(subscription_id).await?;

        let record = UsageRecord {
            id: Uuid::new_v4(),
            subscription_id,
            metric_name: metric_name.to_string(),
            action,
            quantity,
            recorded_at: self.now(),
        };
        let record = self.storage().usage().record(record).await?;

        // Keep the limit counter in step when one exists for this metric
        if self
            .storage()
            .limits()
            .find_limit(subscription.customer_id, metric_name)
            .await?
            .is_some()
        {
            match action {
                UsageAction::Increment => {
                    self.storage()
                        .limits()
                        .try_consume(subscription.customer_id, metric_name, quantity)
                        .await?;
                }
                UsageAction::Set => {
                    self.storage()
                        .limits()
                        .set_current(subscription.customer_id, metric_name, quantity)
                        .await?;
                }
            }
        }

        Ok(record)
    }

    pub async fn list_usage(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>> {
        self.storage().usage().list_by_subscription(subscription_id).await
    }
}
