//! Storage port
//!
//! Database-agnostic repository traits over the billing entities. Adapters
//! implement these against their store of choice; the crate ships an
//! in-memory adapter used by tests and the mock provider stack.
//!
//! Adapters MUST serialize concurrent writes to the same subscription,
//! payment method (default flag) and promo code (redemption counter) rows,
//! either with row-level locks or an optimistic version column. The engines
//! perform read-compute-write sequences that are only safe under that
//! guarantee.

pub mod memory;
pub mod traits;

pub use memory::MemoryStorage;
pub use traits::{
    AddOnRepository, AuditLogRepository, AutomaticDiscountRepository, CustomerRepository,
    EntitlementRepository, IdempotencyRepository, InvoiceRepository, JobRepository,
    LimitRepository, PaymentMethodRepository, PaymentRepository, PayoutRepository,
    PlanRepository, PriceRepository, PromoCodeRepository, RefundRepository, Storage,
    SubscriptionAddOnRepository, SubscriptionRepository, TxWork, UsageRepository,
    VendorRepository, WebhookEventRepository,
};
