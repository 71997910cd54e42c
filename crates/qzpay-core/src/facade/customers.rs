//! Customer operations

use uuid::Uuid;
use validator::Validate;

use crate::{
    common::{Page, Pagination},
    events::{BillingEvent, BillingEventType},
    models::{CreateCustomerRequest, Customer, UpdateCustomerRequest},
    provider::{PaymentProvider, ProviderCustomerRequest},
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    /// Create a customer locally and register it at the payment provider
    pub async fn create_customer(&self, request: CreateCustomerRequest) -> Result<Customer> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        if self
            .storage()
            .customers()
            .find_by_email(&request.email)
            .await?
            .is_some()
        {
            return Err(Error::conflict(format!(
                "Email {} is already in use",
                request.email
            )));
        }

        let now = self.now();
        let mut customer = Customer {
            id: Uuid::new_v4(),
            external_id: request.external_id,
            email: request.email,
            name: request.name,
            phone: request.phone,
            preferences: request.preferences,
            billing_address: request.billing_address,
            shipping_address: request.shipping_address,
            tax_id: request.tax_id,
            tax_id_type: request.tax_id_type,
            provider_customer_ids: Default::default(),
            metadata: request.metadata,
            livemode: self.livemode(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        // Provider registration is best-effort; a transient provider outage
        // must not block customer creation
        match self
            .provider()
            .create_customer(ProviderCustomerRequest {
                email: customer.email.clone(),
                name: customer.name.clone(),
                metadata: serde_json::json!({ "external_id": customer.external_id }),
            })
            .await
        {
            Ok(provider_customer) => {
                customer
                    .provider_customer_ids
                    .insert(self.provider().kind(), provider_customer.id);
            }
            Err(e) => {
                tracing::warn!(error = %e, "provider customer registration deferred");
            }
        }

        let customer = self.storage().customers().create(customer).await?;

        self.audit(
            "customer",
            customer.id,
            "created",
            None,
            serde_json::to_value(&customer).ok(),
        )
        .await;
        self.emit(
            BillingEvent::new(BillingEventType::CustomerCreated, self.now())
                .with_customer(customer.id)
                .with_data(serde_json::json!({ "email": customer.email })),
        );

        Ok(customer)
    }

    /// Partial update
    pub async fn update_customer(
        &self,
        id: Uuid,
        request: UpdateCustomerRequest,
    ) -> Result<Customer> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        let before = self.storage().customers().find_by_id(id).await?;
        let customer = self.storage().customers().update(id, request).await?;

        self.audit(
            "customer",
            customer.id,
            "updated",
            before.and_then(|c| serde_json::to_value(&c).ok()),
            serde_json::to_value(&customer).ok(),
        )
        .await;
        self.emit(
            BillingEvent::new(BillingEventType::CustomerUpdated, self.now())
                .with_customer(customer.id),
        );

        Ok(customer)
    }

    /// Soft delete
    pub async fn delete_customer(&self, id: Uuid) -> Result<()> {
        let existed = self.storage().customers().delete(id).await?;
        if !existed {
            return Err(Error::not_found(format!("Customer {} not found", id)));
        }

        self.audit("customer", id, "deleted", None, None).await;
        self.emit(
            BillingEvent::new(BillingEventType::CustomerDeleted, self.now()).with_customer(id),
        );
        Ok(())
    }

    pub async fn get_customer(&self, id: Uuid) -> Result<Customer> {
        self.storage()
            .customers()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Customer {} not found", id)))
    }

    pub async fn get_customer_by_external_id(&self, external_id: &str) -> Result<Customer> {
        self.storage()
            .customers()
            .find_by_external_id(external_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Customer {} not found", external_id)))
    }

    pub async fn get_customer_by_email(&self, email: &str) -> Result<Option<Customer>> {
        self.storage().customers().find_by_email(email).await
    }

    pub async fn list_customers(&self, pagination: Pagination) -> Result<Page<Customer>> {
        self.storage().customers().list(pagination).await
    }
}
