//! Persisted inbound webhook events
//!
//! `provider_event_id` is the idempotency key: processing the same id twice
//! must be a no-op. Events whose handlers keep failing are dead-lettered for
//! manual replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProviderKind;

/// Processing status of a stored webhook event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "webhook_event_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Failed,
    DeadLettered,
}

/// A stored inbound webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider_event_id: String,
    pub provider: ProviderKind,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
