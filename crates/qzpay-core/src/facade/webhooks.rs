//! Webhook ingress wiring
//!
//! The host's HTTP endpoint hands the raw body and signature header here.
//! Verification failures map to 400; everything else — including unknown
//! event types and handler failures — should be acknowledged with 200, with
//! failures persisted for manual replay.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::{
    events::{BillingEvent, BillingEventType},
    models::{WebhookEventRecord, WebhookEventStatus},
    provider::PaymentProvider,
    storage::Storage,
    webhooks::{ProcessOutcome, WebhookHandler},
    Result,
};

use super::QzPay;

impl QzPay {
    /// Register a handler for a provider event type
    pub async fn register_webhook_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn WebhookHandler>,
    ) {
        self.dispatcher.register(event_type, handler).await;
    }

    /// Verify, persist and dispatch an inbound webhook.
    ///
    /// Fails fast with `InvalidSignature`, `WebhookReplayRejected` or
    /// `MalformedWebhook`; those map to 400 at the HTTP layer. A duplicate
    /// provider event id short-circuits before the handler runs. Handler
    /// failures dead-letter the stored event and still return an outcome.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<ProcessOutcome> {
        let event = self
            .provider()
            .webhooks()
            .construct_event(payload, signature)?;

        let now = self.now();
        self.emit(
            BillingEvent::new(BillingEventType::WebhookReceived, now).with_data(json!({
                "provider_event_id": event.id,
                "event_type": event.event_type,
            })),
        );

        // Persisted dedup by provider event id
        let record = WebhookEventRecord {
            id: Uuid::new_v4(),
            provider_event_id: event.id.clone(),
            provider: self.provider().kind(),
            event_type: event.event_type.clone(),
            payload: event.data.clone(),
            status: WebhookEventStatus::Received,
            attempts: 0,
            last_error: None,
            received_at: now,
            processed_at: None,
        };
        let stored = self.storage().webhook_events().insert_if_new(record).await?;

        let Some(mut stored) = stored else {
            return Ok(ProcessOutcome {
                processed: false,
                error: None,
                duplicate: true,
            });
        };

        let outcome = self.dispatcher.process(&event).await;

        stored.attempts += 1;
        if outcome.processed {
            stored.status = WebhookEventStatus::Processed;
            stored.processed_at = Some(self.now());
        } else {
            // Kept for manual replay; the HTTP layer still acks
            stored.status = WebhookEventStatus::DeadLettered;
            stored.last_error = outcome.error.clone();
        }
        self.storage().webhook_events().save(stored).await?;

        Ok(outcome)
    }

    /// Events whose handlers failed, retained for manual replay
    pub async fn dead_lettered_webhooks(&self) -> Result<Vec<WebhookEventRecord>> {
        self.storage()
            .webhook_events()
            .list_by_status(WebhookEventStatus::DeadLettered)
            .await
    }
}
