//! Lifecycle event stream
//!
//! The engine and façade publish typed events; hosts subscribe with
//! `on`/`once` and get an unsubscribe handle back. Delivery is best-effort:
//! events fire after the storage write succeeds, and a handler's behavior
//! never affects the state transition that produced the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types emitted by the engine and façade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingEventType {
    #[serde(rename = "subscription.renewed")]
    SubscriptionRenewed,
    #[serde(rename = "subscription.renewal_failed")]
    SubscriptionRenewalFailed,
    #[serde(rename = "subscription.trial_converted")]
    SubscriptionTrialConverted,
    #[serde(rename = "subscription.trial_conversion_failed")]
    SubscriptionTrialConversionFailed,
    #[serde(rename = "subscription.entered_grace_period")]
    SubscriptionEnteredGracePeriod,
    #[serde(rename = "subscription.retry_scheduled")]
    SubscriptionRetryScheduled,
    #[serde(rename = "subscription.retry_succeeded")]
    SubscriptionRetrySucceeded,
    #[serde(rename = "subscription.retry_failed")]
    SubscriptionRetryFailed,
    #[serde(rename = "subscription.canceled_nonpayment")]
    SubscriptionCanceledNonpayment,
    #[serde(rename = "customer.created")]
    CustomerCreated,
    #[serde(rename = "customer.updated")]
    CustomerUpdated,
    #[serde(rename = "customer.deleted")]
    CustomerDeleted,
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,
    #[serde(rename = "invoice.paid")]
    InvoicePaid,
    #[serde(rename = "webhook.received")]
    WebhookReceived,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionRenewed => "subscription.renewed",
            BillingEventType::SubscriptionRenewalFailed => "subscription.renewal_failed",
            BillingEventType::SubscriptionTrialConverted => "subscription.trial_converted",
            BillingEventType::SubscriptionTrialConversionFailed => {
                "subscription.trial_conversion_failed"
            }
            BillingEventType::SubscriptionEnteredGracePeriod => {
                "subscription.entered_grace_period"
            }
            BillingEventType::SubscriptionRetryScheduled => "subscription.retry_scheduled",
            BillingEventType::SubscriptionRetrySucceeded => "subscription.retry_succeeded",
            BillingEventType::SubscriptionRetryFailed => "subscription.retry_failed",
            BillingEventType::SubscriptionCanceledNonpayment => {
                "subscription.canceled_nonpayment"
            }
            BillingEventType::CustomerCreated => "customer.created",
            BillingEventType::CustomerUpdated => "customer.updated",
            BillingEventType::CustomerDeleted => "customer.deleted",
            BillingEventType::PaymentSucceeded => "payment.succeeded",
            BillingEventType::PaymentFailed => "payment.failed",
            BillingEventType::PaymentRefunded => "payment.refunded",
            BillingEventType::InvoicePaid => "invoice.paid",
            BillingEventType::WebhookReceived => "webhook.received",
        }
    }
}

/// An emitted billing event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    #[serde(rename = "type")]
    pub event_type: BillingEventType,
    pub subscription_id: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BillingEvent {
    pub fn new(event_type: BillingEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_type,
            subscription_id: None,
            customer_id: None,
            data: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn with_subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    pub fn with_customer(mut self, customer_id: Uuid) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

type Handler = Arc<dyn Fn(&BillingEvent) + Send + Sync>;

/// Handle returned by `on`/`once`; pass to `off` to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    event_type: BillingEventType,
    handler: Handler,
    once: bool,
}

/// Handler registry for the lifecycle event stream
#[derive(Default)]
pub struct EventEmitter {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to an event type; returns a handle for `off`
    pub fn on<F>(&self, event_type: BillingEventType, handler: F) -> HandlerId
    where
        F: Fn(&BillingEvent) + Send + Sync + 'static,
    {
        self.register(event_type, Arc::new(handler), false)
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, event_type: BillingEventType, handler: F) -> HandlerId
    where
        F: Fn(&BillingEvent) + Send + Sync + 'static,
    {
        self.register(event_type, Arc::new(handler), true)
    }

    fn register(
        &self,
        event_type: BillingEventType,
        handler: Handler,
        once: bool,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.registrations.lock().unwrap().push(Registration {
            id,
            event_type,
            handler,
            once,
        });
        id
    }

    /// Remove a handler; returns false when it was already gone
    pub fn off(&self, id: HandlerId) -> bool {
        let mut registrations = self.registrations.lock().unwrap();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    /// Deliver an event to every matching handler. `once` handlers are
    /// removed before their callback runs.
    pub fn emit(&self, event: &BillingEvent) {
        let handlers: Vec<Handler> = {
            let mut registrations = self.registrations.lock().unwrap();
            let matching: Vec<Handler> = registrations
                .iter()
                .filter(|r| r.event_type == event.event_type)
                .map(|r| r.handler.clone())
                .collect();
            registrations.retain(|r| !(r.once && r.event_type == event.event_type));
            matching
        };

        for handler in handlers {
            handler(event);
        }
    }

    /// Drop every registration. Called on façade teardown.
    pub fn close(&self) {
        self.registrations.lock().unwrap().clear();
    }

    pub fn handler_count(&self) -> usize {
        self.registrations.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(event_type: BillingEventType) -> BillingEvent {
        BillingEvent::new(event_type, Utc::now())
    }

    #[test]
    fn test_on_receives_matching_events_only() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        emitter.on(BillingEventType::SubscriptionRenewed, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&event(BillingEventType::SubscriptionRenewed));
        emitter.emit(&event(BillingEventType::PaymentFailed));
        emitter.emit(&event(BillingEventType::SubscriptionRenewed));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        emitter.once(BillingEventType::InvoicePaid, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(&event(BillingEventType::InvoicePaid));
        emitter.emit(&event(BillingEventType::InvoicePaid));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_off_unsubscribes() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let id = emitter.on(BillingEventType::CustomerCreated, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(emitter.off(id));
        emitter.emit(&event(BillingEventType::CustomerCreated));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!emitter.off(id));
    }

    #[test]
    fn test_close_releases_everything() {
        let emitter = EventEmitter::new();
        emitter.on(BillingEventType::CustomerCreated, |_| {});
        emitter.on(BillingEventType::PaymentSucceeded, |_| {});
        assert_eq!(emitter.handler_count(), 2);

        emitter.close();
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_event_type_strings() {
        assert_eq!(
            BillingEventType::SubscriptionEnteredGracePeriod.as_str(),
            "subscription.entered_grace_period"
        );
        assert_eq!(
            serde_json::to_string(&BillingEventType::SubscriptionRenewed).unwrap(),
            "\"subscription.renewed\""
        );
    }
}
