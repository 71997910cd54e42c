//! Entitlement and limit models
//!
//! Entitlements are named capabilities granted to a customer; limits are
//! named quotas with a current counter. Re-granting an entitlement never
//! shortens it: the stored expiry becomes the later of the two, and a grant
//! with no expiry wins over any finite one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a grant or limit came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "grant_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Subscription,
    Addon,
    Manual,
    Promotion,
}

/// Entitlement definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementDefinition {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A customer's grant of an entitlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementGrant {
    pub customer_id: Uuid,
    pub entitlement_key: String,
    pub granted_at: DateTime<Utc>,
    /// None means no expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub source: GrantSource,
    pub source_id: Option<String>,
}

impl EntitlementGrant {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires) => now < expires,
            None => true,
        }
    }

    /// Merge an incoming re-grant into this grant. The expiry only ever
    /// extends: `None` beats any finite expiry, otherwise the later wins.
    pub fn merge_regrant(&mut self, incoming: &EntitlementGrant) {
        self.expires_at = match (self.expires_at, incoming.expires_at) {
            (None, _) | (_, None) => None,
            (Some(a), Some(b)) => Some(a.max(b)),
        };
        self.source = incoming.source;
        self.source_id = incoming.source_id.clone();
    }
}

/// Limit definition with its default quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitDefinition {
    pub key: String,
    pub name: String,
    pub default_value: i64,
    pub created_at: DateTime<Utc>,
}

/// A customer's limit: `allowed = current_value < max_value`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerLimit {
    pub customer_id: Uuid,
    pub limit_key: String,
    pub max_value: i64,
    pub current_value: i64,
    pub reset_at: Option<DateTime<Utc>>,
    pub source: GrantSource,
}

impl CustomerLimit {
    pub fn is_allowed(&self) -> bool {
        self.current_value < self.max_value
    }

    pub fn remaining(&self) -> i64 {
        (self.max_value - self.current_value).max(0)
    }
}
