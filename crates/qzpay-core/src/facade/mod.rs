//! Billing façade
//!
//! `QzPay` composes the storage and provider ports with the discount,
//! metrics and lifecycle engines, and exposes the grouped operations the
//! host application calls: customers, plans, subscriptions, payments,
//! invoices, promo codes, entitlements, limits, vendors and webhooks.
//! Lifecycle events stream through `on`/`once`; `close` releases every
//! subscription on teardown.

mod customers;
mod entitlements;
mod invoices;
mod metrics;
mod payments;
mod plans;
mod promos;
mod subscriptions;
mod vendors;
mod webhooks;

pub use payments::{ProviderChargeProcessor, StoragePaymentMethodResolver};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    events::{BillingEvent, BillingEventType, EventEmitter, HandlerId},
    health::{HealthChecker, SystemHealth},
    lifecycle::{LifecycleConfig, LifecycleEngine, LifecycleRunResult},
    models::{ActorType, AuditLog},
    provider::PaymentProvider,
    storage::Storage,
    webhooks::WebhookDispatcher,
    Result,
};

/// The billing engine façade
pub struct QzPay {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn PaymentProvider>,
    events: Arc<EventEmitter>,
    dispatcher: Arc<WebhookDispatcher>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl QzPay {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn PaymentProvider>,
        config: Config,
    ) -> Self {
        Self::with_clock(storage, provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn PaymentProvider>,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dispatcher = Arc::new(WebhookDispatcher::new(
            clock.clone(),
            config.webhooks.processed_id_ttl_seconds,
        ));
        Self {
            storage,
            provider,
            events: Arc::new(EventEmitter::new()),
            dispatcher,
            clock,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn provider(&self) -> &Arc<dyn PaymentProvider> {
        &self.provider
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn livemode(&self) -> bool {
        self.config.billing.livemode
    }

    // --- Events ---

    /// Subscribe to a billing event type
    pub fn on<F>(&self, event_type: BillingEventType, handler: F) -> HandlerId
    where
        F: Fn(&BillingEvent) + Send + Sync + 'static,
    {
        self.events.on(event_type, handler)
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, event_type: BillingEventType, handler: F) -> HandlerId
    where
        F: Fn(&BillingEvent) + Send + Sync + 'static,
    {
        self.events.once(event_type, handler)
    }

    /// Unsubscribe a handler
    pub fn off(&self, id: HandlerId) -> bool {
        self.events.off(id)
    }

    /// Release every event subscription
    pub async fn close(&self) {
        self.events.close();
    }

    pub(crate) fn emit(&self, event: BillingEvent) {
        self.events.emit(&event);
    }

    // --- Lifecycle ---

    /// Build the lifecycle engine wired to this façade's ports
    pub fn lifecycle_engine(&self) -> LifecycleEngine {
        LifecycleEngine::new(
            self.storage.clone(),
            Arc::new(ProviderChargeProcessor::new(
                self.storage.clone(),
                self.provider.clone(),
                self.events.clone(),
                self.clock.clone(),
                self.config.billing.livemode,
            )),
            Arc::new(StoragePaymentMethodResolver::new(self.storage.clone())),
            self.events.clone(),
            self.clock.clone(),
            LifecycleConfig::from(&self.config.billing),
        )
    }

    /// Run the four lifecycle phases once
    pub async fn run_lifecycle(&self) -> Result<LifecycleRunResult> {
        self.lifecycle_engine().run().await
    }

    // --- Health ---

    /// Probe the storage and provider ports
    pub async fn health(&self) -> SystemHealth {
        HealthChecker::new(
            self.storage.clone(),
            self.provider.clone(),
            self.config.health.clone(),
        )
        .check()
        .await
    }

    // --- Audit ---

    pub(crate) async fn audit(
        &self,
        entity_type: &str,
        entity_id: impl ToString,
        action: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) {
        let entry = AuditLog {
            id: uuid::Uuid::new_v4(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            actor_type: ActorType::Api,
            actor_id: None,
            before,
            after,
            at: self.now(),
        };
        // Audit writes are best-effort; they never fail the operation
        if let Err(e) = self.storage.audit_logs().append(entry).await {
            tracing::warn!(error = %e, "audit log write failed");
        }
    }
}
