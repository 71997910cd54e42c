//! Customer model
//!
//! Customers belong to the owning application; `external_id` is the host's
//! user key. Card material never lands here, only per-provider customer ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use super::ProviderKind;

/// Postal address used for billing and shipping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub line1: String,
    pub line2: Option<String>,
    pub city: String,
    pub state: Option<String>,
    pub postal_code: String,
    pub country: String,
}

/// Customer preferences the host cares about for billing decisions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerPreferences {
    pub language: Option<String>,
    pub segment: Option<String>,
    pub tier: Option<String>,
}

/// Customer entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    /// The owning application's user key
    pub external_id: String,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,

    pub preferences: CustomerPreferences,
    pub billing_address: Option<Address>,
    pub shipping_address: Option<Address>,

    pub tax_id: Option<String>,
    pub tax_id_type: Option<String>,

    /// provider -> provider-side customer id
    pub provider_customer_ids: HashMap<ProviderKind, String>,

    pub metadata: serde_json::Value,
    pub livemode: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Customer {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Create customer request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateCustomerRequest {
    #[validate(length(min = 1, max = 255))]
    pub external_id: String,

    #[validate(email)]
    pub email: String,

    #[validate(length(max = 255))]
    pub name: Option<String>,

    #[validate(length(max = 50))]
    pub phone: Option<String>,

    #[serde(default)]
    pub preferences: CustomerPreferences,

    pub billing_address: Option<Address>,
    pub shipping_address: Option<Address>,

    pub tax_id: Option<String>,
    pub tax_id_type: Option<String>,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Update customer request (partial)
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateCustomerRequest {
    #[validate(email)]
    pub email: Option<String>,

    #[validate(length(max = 255))]
    pub name: Option<String>,

    #[validate(length(max = 50))]
    pub phone: Option<String>,

    pub preferences: Option<CustomerPreferences>,
    pub billing_address: Option<Address>,
    pub shipping_address: Option<Address>,
    pub tax_id: Option<String>,
    pub tax_id_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_validates_email() {
        let request = CreateCustomerRequest {
            external_id: "user-1".to_string(),
            email: "not-an-email".to_string(),
            name: None,
            phone: None,
            preferences: CustomerPreferences::default(),
            billing_address: None,
            shipping_address: None,
            tax_id: None,
            tax_id_type: None,
            metadata: serde_json::Value::Null,
        };
        assert!(request.validate().is_err());
    }
}
