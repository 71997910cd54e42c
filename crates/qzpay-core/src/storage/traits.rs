//! Repository traits for storage abstraction
//!
//! These traits define the interface that all storage adapters must provide.
//! All writes return the updated entity; all lists return paginated results
//! ordered by `created_at` descending unless stated otherwise. Soft-deleted
//! rows are filtered out of queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
    common::{Page, Pagination},
    jobs::{Job, JobStatus},
    models::{
        AddOn, AuditLog, AutomaticDiscount, Customer, CustomerLimit, EntitlementDefinition,
        EntitlementGrant, IdempotencyRecord, Invoice, LimitDefinition, Payment,
        PaymentMethod, Plan, Price, PromoCode, Refund, Subscription, SubscriptionAddOn,
        SubscriptionStatus, UpdateCustomerRequest, UsageRecord, Vendor, VendorPayout,
        WebhookEventRecord, WebhookEventStatus,
    },
    Result,
};

/// Customer repository
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn create(&self, customer: Customer) -> Result<Customer>;

    /// Partial update from a request
    async fn update(&self, id: Uuid, request: UpdateCustomerRequest) -> Result<Customer>;

    /// Full-row replace, used by engines that read-modify-write
    async fn save(&self, customer: Customer) -> Result<Customer>;

    /// Soft delete; returns false when the customer does not exist
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Customer>>;
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Customer>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Customer>>;
    async fn list(&self, pagination: Pagination) -> Result<Page<Customer>>;
}

/// Plan repository
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn create(&self, plan: Plan) -> Result<Plan>;
    async fn save(&self, plan: Plan) -> Result<Plan>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>>;
    async fn list(&self, pagination: Pagination, active_only: bool) -> Result<Page<Plan>>;
}

/// Price repository
#[async_trait]
pub trait PriceRepository: Send + Sync {
    async fn create(&self, price: Price) -> Result<Price>;
    async fn save(&self, price: Price) -> Result<Price>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Price>>;
    async fn list_by_plan(&self, plan_id: Uuid) -> Result<Vec<Price>>;
}

/// Subscription repository
#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn create(&self, subscription: Subscription) -> Result<Subscription>;
    async fn save(&self, subscription: Subscription) -> Result<Subscription>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>>;
    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<Subscription>>;
    async fn find_active_by_customer(&self, customer_id: Uuid) -> Result<Option<Subscription>>;
    async fn list(&self, pagination: Pagination) -> Result<Page<Subscription>>;

    /// Subscriptions whose renewal is due: active, not flagged to cancel at
    /// period end, and `current_period_end <= now`
    async fn due_for_renewal(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;

    async fn list_by_status(&self, status: SubscriptionStatus) -> Result<Vec<Subscription>>;
}

/// Payment repository
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn create(&self, payment: Payment) -> Result<Payment>;
    async fn save(&self, payment: Payment) -> Result<Payment>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>>;
    async fn find_by_provider_payment_id(&self, provider_payment_id: &str)
        -> Result<Option<Payment>>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>>;
    async fn list_by_customer(&self, customer_id: Uuid, pagination: Pagination)
        -> Result<Page<Payment>>;

    /// Payments created in `[from, to)`
    async fn list_in_period(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>>;
}

/// Refund repository
#[async_trait]
pub trait RefundRepository: Send + Sync {
    async fn create(&self, refund: Refund) -> Result<Refund>;
    async fn list_by_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>>;
}

/// Payment method repository
#[async_trait]
pub trait PaymentMethodRepository: Send + Sync {
    async fn create(&self, method: PaymentMethod) -> Result<PaymentMethod>;
    async fn save(&self, method: PaymentMethod) -> Result<PaymentMethod>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>>;
    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<PaymentMethod>>;
    async fn default_for_customer(&self, customer_id: Uuid) -> Result<Option<PaymentMethod>>;

    /// Atomically make `payment_method_id` the customer's default and flip
    /// every other method of that customer to non-default
    async fn set_default(&self, customer_id: Uuid, payment_method_id: Uuid)
        -> Result<PaymentMethod>;

    /// Detach a payment method; returns false when it does not exist
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Invoice repository
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn create(&self, invoice: Invoice) -> Result<Invoice>;
    async fn save(&self, invoice: Invoice) -> Result<Invoice>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Invoice>>;
    async fn find_by_number(&self, number: &str) -> Result<Option<Invoice>>;
    async fn list_by_customer(&self, customer_id: Uuid, pagination: Pagination)
        -> Result<Page<Invoice>>;
    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<Invoice>>;

    /// Next unique invoice number, e.g. "INV-000042"
    async fn next_number(&self) -> Result<String>;
}

/// Promo code repository
#[async_trait]
pub trait PromoCodeRepository: Send + Sync {
    async fn create(&self, promo: PromoCode) -> Result<PromoCode>;
    async fn save(&self, promo: PromoCode) -> Result<PromoCode>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<PromoCode>>;
    async fn find_by_code(&self, code: &str) -> Result<Option<PromoCode>>;
    async fn list(&self, pagination: Pagination) -> Result<Page<PromoCode>>;

    /// Serialized redemption: increments the counter and records the
    /// customer, failing with `Conflict` when `max_redemptions` is reached
    /// and `Forbidden` when the per-customer cap is reached.
    async fn redeem(&self, id: Uuid, customer_id: Uuid) -> Result<PromoCode>;

    async fn customer_redemption_count(&self, id: Uuid, customer_id: Uuid) -> Result<i64>;
}

/// Automatic discount repository
#[async_trait]
pub trait AutomaticDiscountRepository: Send + Sync {
    async fn create(&self, discount: AutomaticDiscount) -> Result<AutomaticDiscount>;
    async fn save(&self, discount: AutomaticDiscount) -> Result<AutomaticDiscount>;
    async fn list_active(&self) -> Result<Vec<AutomaticDiscount>>;
}

/// Entitlement repository
#[async_trait]
pub trait EntitlementRepository: Send + Sync {
    async fn define(&self, definition: EntitlementDefinition) -> Result<EntitlementDefinition>;
    async fn find_definition(&self, key: &str) -> Result<Option<EntitlementDefinition>>;
    async fn list_definitions(&self) -> Result<Vec<EntitlementDefinition>>;

    /// Insert or merge a grant. Re-granting keeps the later expiry; a grant
    /// with no expiry wins over any finite one.
    async fn upsert_grant(&self, grant: EntitlementGrant) -> Result<EntitlementGrant>;

    async fn find_grant(&self, customer_id: Uuid, key: &str) -> Result<Option<EntitlementGrant>>;
    async fn list_grants(&self, customer_id: Uuid) -> Result<Vec<EntitlementGrant>>;

    /// Remove a grant; returns false when none existed
    async fn revoke(&self, customer_id: Uuid, key: &str) -> Result<bool>;
}

/// Limit repository
#[async_trait]
pub trait LimitRepository: Send + Sync {
    async fn define(&self, definition: LimitDefinition) -> Result<LimitDefinition>;
    async fn find_definition(&self, key: &str) -> Result<Option<LimitDefinition>>;

    async fn set_limit(&self, limit: CustomerLimit) -> Result<CustomerLimit>;
    async fn find_limit(&self, customer_id: Uuid, key: &str) -> Result<Option<CustomerLimit>>;
    async fn list_limits(&self, customer_id: Uuid) -> Result<Vec<CustomerLimit>>;

    /// Atomically consume quota. Fails with `Forbidden` when the limit is
    /// already exhausted (`current_value >= max_value`).
    async fn try_consume(&self, customer_id: Uuid, key: &str, quantity: i64)
        -> Result<CustomerLimit>;

    /// Overwrite the current counter (usage `set` action, resets)
    async fn set_current(&self, customer_id: Uuid, key: &str, value: i64)
        -> Result<CustomerLimit>;
}

/// Usage record repository
#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn record(&self, usage: UsageRecord) -> Result<UsageRecord>;
    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>>;
}

/// Vendor repository
#[async_trait]
pub trait VendorRepository: Send + Sync {
    async fn create(&self, vendor: Vendor) -> Result<Vendor>;
    async fn save(&self, vendor: Vendor) -> Result<Vendor>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Vendor>>;
    async fn list(&self, pagination: Pagination) -> Result<Page<Vendor>>;
}

/// Vendor payout repository
#[async_trait]
pub trait PayoutRepository: Send + Sync {
    async fn create(&self, payout: VendorPayout) -> Result<VendorPayout>;
    async fn save(&self, payout: VendorPayout) -> Result<VendorPayout>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<VendorPayout>>;
    async fn list_by_vendor(&self, vendor_id: Uuid) -> Result<Vec<VendorPayout>>;

    /// Payouts scheduled at or before `now` that are still `Scheduled`
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<VendorPayout>>;
}

/// Add-on repository
#[async_trait]
pub trait AddOnRepository: Send + Sync {
    async fn create(&self, addon: AddOn) -> Result<AddOn>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<AddOn>>;
    async fn list_active(&self) -> Result<Vec<AddOn>>;
}

/// Subscription add-on repository
#[async_trait]
pub trait SubscriptionAddOnRepository: Send + Sync {
    async fn attach(&self, addon: SubscriptionAddOn) -> Result<SubscriptionAddOn>;
    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionAddOn>>;
    async fn detach(&self, id: Uuid) -> Result<bool>;
}

/// Job repository
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<Job>;
    async fn save(&self, job: Job) -> Result<Job>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    /// Ready jobs (pending/scheduled with `scheduled_at <= now`), in worker
    /// pick-up order
    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;
}

/// Webhook event repository
#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    /// Insert the event unless one with the same `provider_event_id`
    /// already exists. Returns `None` for duplicates.
    async fn insert_if_new(&self, event: WebhookEventRecord)
        -> Result<Option<WebhookEventRecord>>;

    async fn find_by_provider_event_id(&self, provider_event_id: &str)
        -> Result<Option<WebhookEventRecord>>;
    async fn save(&self, event: WebhookEventRecord) -> Result<WebhookEventRecord>;
    async fn list_by_status(&self, status: WebhookEventStatus) -> Result<Vec<WebhookEventRecord>>;
}

/// Idempotency key repository
#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    /// Returns the cached record unless it has expired
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
    async fn put(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Audit log repository (append-only)
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn append(&self, entry: AuditLog) -> Result<AuditLog>;
    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        pagination: Pagination,
    ) -> Result<Page<AuditLog>>;
}

/// Work to run inside a storage transaction
pub type TxWork<'a> = Box<dyn FnOnce(&'a dyn Storage) -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// Storage container - holds all repositories and the transaction primitive
#[async_trait]
pub trait Storage: Send + Sync {
    fn customers(&self) -> &dyn CustomerRepository;
    fn plans(&self) -> &dyn PlanRepository;
    fn prices(&self) -> &dyn PriceRepository;
    fn subscriptions(&self) -> &dyn SubscriptionRepository;
    fn payments(&self) -> &dyn PaymentRepository;
    fn refunds(&self) -> &dyn RefundRepository;
    fn payment_methods(&self) -> &dyn PaymentMethodRepository;
    fn invoices(&self) -> &dyn InvoiceRepository;
    fn promo_codes(&self) -> &dyn PromoCodeRepository;
    fn automatic_discounts(&self) -> &dyn AutomaticDiscountRepository;
    fn entitlements(&self) -> &dyn EntitlementRepository;
    fn limits(&self) -> &dyn LimitRepository;
    fn usage(&self) -> &dyn UsageRepository;
    fn vendors(&self) -> &dyn VendorRepository;
    fn payouts(&self) -> &dyn PayoutRepository;
    fn addons(&self) -> &dyn AddOnRepository;
    fn subscription_addons(&self) -> &dyn SubscriptionAddOnRepository;
    fn jobs(&self) -> &dyn JobRepository;
    fn webhook_events(&self) -> &dyn WebhookEventRepository;
    fn idempotency(&self) -> &dyn IdempotencyRepository;
    fn audit_logs(&self) -> &dyn AuditLogRepository;

    /// Run `work` atomically. Multi-row updates that must hold together
    /// (period advance + invoice insert) go through here.
    async fn transaction<'a>(&'a self, work: TxWork<'a>) -> Result<()>;

    /// Cheap liveness check for health probes
    async fn ping(&self) -> Result<()>;
}
