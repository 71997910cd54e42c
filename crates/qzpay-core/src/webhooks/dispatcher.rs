//! Webhook event dispatch
//!
//! A registry maps event type to handler. Processing is idempotent by
//! provider event id: a short-TTL record of processed ids makes the second
//! delivery of the same event a no-op. Handler errors are caught into the
//! per-event outcome; operators replay dead-lettered events manually.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::{clock::Clock, provider::ProviderEvent, Result};

/// A registered webhook handler
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, event: &ProviderEvent) -> Result<()>;
}

/// Outcome of processing one event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub processed: bool,
    pub error: Option<String>,
    /// True when the event id had already been processed and the handler
    /// was skipped
    pub duplicate: bool,
}

impl ProcessOutcome {
    fn processed() -> Self {
        Self {
            processed: true,
            error: None,
            duplicate: false,
        }
    }

    fn duplicate() -> Self {
        Self {
            processed: false,
            error: None,
            duplicate: true,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            processed: false,
            error: Some(error.into()),
            duplicate: false,
        }
    }
}

/// Event-type keyed handler registry with idempotent processing
pub struct WebhookDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn WebhookHandler>>>,
    processed_ids: DashMap<String, DateTime<Utc>>,
    processed_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl WebhookDispatcher {
    pub fn new(clock: Arc<dyn Clock>, processed_ttl_seconds: i64) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            processed_ids: DashMap::new(),
            processed_ttl: Duration::seconds(processed_ttl_seconds.max(1)),
            clock,
        }
    }

    /// Register the handler for an event type, replacing any previous one
    pub async fn register(&self, event_type: impl Into<String>, handler: Arc<dyn WebhookHandler>) {
        self.handlers.write().await.insert(event_type.into(), handler);
    }

    pub async fn unregister(&self, event_type: &str) -> bool {
        self.handlers.write().await.remove(event_type).is_some()
    }

    /// Process one verified event. Duplicates (same provider event id inside
    /// the TTL window) skip the handler entirely. Handler errors are caught
    /// and returned, never propagated.
    pub async fn process(&self, event: &ProviderEvent) -> ProcessOutcome {
        let now = self.clock.now();
        self.purge_expired(now);

        if self.processed_ids.contains_key(&event.id) {
            info!(event_id = %event.id, "duplicate webhook event skipped");
            return ProcessOutcome::duplicate();
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&event.event_type).cloned()
        };

        let Some(handler) = handler else {
            return ProcessOutcome::failed("No handler registered");
        };

        match handler.handle(event).await {
            Ok(()) => {
                self.processed_ids.insert(event.id.clone(), now);
                ProcessOutcome::processed()
            }
            Err(e) => {
                warn!(event_id = %event.id, event_type = %event.event_type, error = %e,
                    "webhook handler failed");
                ProcessOutcome::failed(e.to_string())
            }
        }
    }

    fn purge_expired(&self, now: DateTime<Utc>) {
        let ttl = self.processed_ttl;
        self.processed_ids.retain(|_, at| now - *at < ttl);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::Error;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl WebhookHandler for CountingHandler {
        async fn handle(&self, _event: &ProviderEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(Error::internal("handler exploded"))
            } else {
                Ok(())
            }
        }
    }

    fn event(id: &str, event_type: &str) -> ProviderEvent {
        ProviderEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            data: serde_json::json!({}),
            created: Utc::now(),
        }
    }

    fn dispatcher() -> (WebhookDispatcher, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        (WebhookDispatcher::new(clock.clone(), 3600), clock)
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let (dispatcher, _) = dispatcher();
        let handler = CountingHandler::new(false);
        dispatcher.register("payment.updated", handler.clone()).await;

        let outcome = dispatcher.process(&event("evt_1", "payment.updated")).await;
        assert!(outcome.processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_handler_registered() {
        let (dispatcher, _) = dispatcher();
        let outcome = dispatcher.process(&event("evt_1", "unknown.type")).await;
        assert!(!outcome.processed);
        assert_eq!(outcome.error.as_deref(), Some("No handler registered"));
        assert!(!outcome.duplicate);
    }

    #[tokio::test]
    async fn test_handler_error_is_caught() {
        let (dispatcher, _) = dispatcher();
        let handler = CountingHandler::new(true);
        dispatcher.register("payment.updated", handler.clone()).await;

        let outcome = dispatcher.process(&event("evt_1", "payment.updated")).await;
        assert!(!outcome.processed);
        assert!(outcome.error.as_deref().unwrap().contains("handler exploded"));

        // Failed events are not marked processed, so a redelivery retries
        let outcome = dispatcher.process(&event("evt_1", "payment.updated")).await;
        assert!(!outcome.duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_noop() {
        let (dispatcher, _) = dispatcher();
        let handler = CountingHandler::new(false);
        dispatcher.register("payment.updated", handler.clone()).await;

        let first = dispatcher.process(&event("evt_1", "payment.updated")).await;
        assert!(first.processed);

        let second = dispatcher.process(&event("evt_1", "payment.updated")).await;
        assert!(second.duplicate);
        assert!(!second.processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_processed_ids_expire_after_ttl() {
        let (dispatcher, clock) = dispatcher();
        let handler = CountingHandler::new(false);
        dispatcher.register("payment.updated", handler.clone()).await;

        dispatcher.process(&event("evt_1", "payment.updated")).await;
        clock.advance(Duration::seconds(3601));

        let outcome = dispatcher.process(&event("evt_1", "payment.updated")).await;
        assert!(outcome.processed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (dispatcher, _) = dispatcher();
        dispatcher
            .register("payment.updated", CountingHandler::new(false))
            .await;
        assert!(dispatcher.unregister("payment.updated").await);
        assert!(!dispatcher.unregister("payment.updated").await);

        let outcome = dispatcher.process(&event("evt_2", "payment.updated")).await;
        assert!(!outcome.processed);
    }
}
