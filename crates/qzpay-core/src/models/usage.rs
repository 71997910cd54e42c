//! Metered usage records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a usage report changes the metric
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "usage_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    Increment,
    Set,
}

/// A single usage report against a subscription metric
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub metric_name: String,
    pub action: UsageAction,
    pub quantity: i64,
    pub recorded_at: DateTime<Utc>,
}
