//! In-memory storage adapter
//!
//! Backs tests and local development. Writes go through per-table locks; a
//! single transaction mutex serializes `transaction` bodies, which is what
//! gives the lifecycle engine its per-subscription write serialization in
//! this adapter. SQL adapters use row locks instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    clock::Clock,
    common::{Page, Pagination},
    jobs::{sort_by_priority, Job, JobStatus},
    models::{
        AddOn, AuditLog, AutomaticDiscount, Customer, CustomerLimit, EntitlementDefinition,
        EntitlementGrant, IdempotencyRecord, Invoice, LimitDefinition, Payment, PaymentMethod,
        Plan, Price, PromoCode, Refund, Subscription, SubscriptionAddOn, SubscriptionStatus,
        UpdateCustomerRequest, UsageRecord, Vendor, VendorPayout, WebhookEventRecord,
        WebhookEventStatus,
    },
    Error, Result,
};

use super::traits::*;

#[derive(Default)]
struct Tables {
    customers: RwLock<HashMap<Uuid, Customer>>,
    plans: RwLock<HashMap<Uuid, Plan>>,
    prices: RwLock<HashMap<Uuid, Price>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    payments: RwLock<HashMap<Uuid, Payment>>,
    refunds: RwLock<HashMap<Uuid, Refund>>,
    payment_methods: RwLock<HashMap<Uuid, PaymentMethod>>,
    invoices: RwLock<HashMap<Uuid, Invoice>>,
    promo_codes: RwLock<HashMap<Uuid, PromoCode>>,
    // promo id -> customer id -> redemption count
    promo_redemptions: RwLock<HashMap<Uuid, HashMap<Uuid, i64>>>,
    automatic_discounts: RwLock<HashMap<Uuid, AutomaticDiscount>>,
    entitlement_defs: RwLock<HashMap<String, EntitlementDefinition>>,
    entitlement_grants: RwLock<HashMap<(Uuid, String), EntitlementGrant>>,
    limit_defs: RwLock<HashMap<String, LimitDefinition>>,
    customer_limits: RwLock<HashMap<(Uuid, String), CustomerLimit>>,
    usage_records: RwLock<Vec<UsageRecord>>,
    vendors: RwLock<HashMap<Uuid, Vendor>>,
    payouts: RwLock<HashMap<Uuid, VendorPayout>>,
    addons: RwLock<HashMap<Uuid, AddOn>>,
    subscription_addons: RwLock<HashMap<Uuid, SubscriptionAddOn>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
    webhook_events: RwLock<HashMap<Uuid, WebhookEventRecord>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
    audit_logs: RwLock<Vec<AuditLog>>,
}

/// In-memory implementation of the storage port
pub struct MemoryStorage {
    tables: Tables,
    invoice_seq: AtomicI64,
    tx_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl MemoryStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Tables::default(),
            invoice_seq: AtomicI64::new(1),
            tx_lock: tokio::sync::Mutex::new(()),
            clock,
        }
    }
}

fn page_by_created_at<T: Clone>(
    mut items: Vec<T>,
    pagination: Pagination,
    created_at: impl Fn(&T) -> DateTime<Utc>,
) -> Page<T> {
    items.sort_by_key(|item| std::cmp::Reverse(created_at(item)));
    let total = items.len() as i64;
    let data = items
        .into_iter()
        .skip(pagination.offset.max(0) as usize)
        .take(pagination.limit.max(0) as usize)
        .collect();
    Page::new(data, total, pagination)
}

#[async_trait]
impl CustomerRepository for MemoryStorage {
    async fn create(&self, customer: Customer) -> Result<Customer> {
        let mut table = self.tables.customers.write().unwrap();
        if table
            .values()
            .any(|c| c.deleted_at.is_none() && c.email.eq_ignore_ascii_case(&customer.email))
        {
            return Err(Error::conflict(format!(
                "Email {} is already in use",
                customer.email
            )));
        }
        table.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn update(&self, id: Uuid, request: UpdateCustomerRequest) -> Result<Customer> {
        let mut table = self.tables.customers.write().unwrap();
        let customer = table
            .get_mut(&id)
            .filter(|c| c.deleted_at.is_none())
            .ok_or_else(|| Error::not_found(format!("Customer {} not found", id)))?;

        if let Some(email) = request.email {
            customer.email = email;
        }
        if let Some(name) = request.name {
            customer.name = Some(name);
        }
        if let Some(phone) = request.phone {
            customer.phone = Some(phone);
        }
        if let Some(preferences) = request.preferences {
            customer.preferences = preferences;
        }
        if let Some(billing_address) = request.billing_address {
            customer.billing_address = Some(billing_address);
        }
        if let Some(shipping_address) = request.shipping_address {
            customer.shipping_address = Some(shipping_address);
        }
        if let Some(tax_id) = request.tax_id {
            customer.tax_id = Some(tax_id);
        }
        if let Some(tax_id_type) = request.tax_id_type {
            customer.tax_id_type = Some(tax_id_type);
        }
        if let Some(metadata) = request.metadata {
            customer.metadata = metadata;
        }
        customer.updated_at = self.clock.now();

        Ok(customer.clone())
    }

    async fn save(&self, mut customer: Customer) -> Result<Customer> {
        let mut table = self.tables.customers.write().unwrap();
        if !table.contains_key(&customer.id) {
            return Err(Error::not_found(format!(
                "Customer {} not found",
                customer.id
            )));
        }
        customer.updated_at = self.clock.now();
        table.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut table = self.tables.customers.write().unwrap();
        match table.get_mut(&id) {
            Some(customer) if customer.deleted_at.is_none() => {
                customer.deleted_at = Some(self.clock.now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Customer>> {
        let table = self.tables.customers.read().unwrap();
        Ok(table.get(&id).filter(|c| c.deleted_at.is_none()).cloned())
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<Customer>> {
        let table = self.tables.customers.read().unwrap();
        Ok(table
            .values()
            .find(|c| c.deleted_at.is_none() && c.external_id == external_id)
            .cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Customer>> {
        let table = self.tables.customers.read().unwrap();
        Ok(table
            .values()
            .find(|c| c.deleted_at.is_none() && c.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<Customer>> {
        let table = self.tables.customers.read().unwrap();
        let items: Vec<_> = table
            .values()
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect();
        Ok(page_by_created_at(items, pagination, |c| c.created_at))
    }
}

#[async_trait]
impl PlanRepository for MemoryStorage {
    async fn create(&self, plan: Plan) -> Result<Plan> {
        self.tables
            .plans
            .write()
            .unwrap()
            .insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn save(&self, mut plan: Plan) -> Result<Plan> {
        let mut table = self.tables.plans.write().unwrap();
        if !table.contains_key(&plan.id) {
            return Err(Error::not_found(format!("Plan {} not found", plan.id)));
        }
        plan.updated_at = self.clock.now();
        table.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>> {
        Ok(self.tables.plans.read().unwrap().get(&id).cloned())
    }

    async fn list(&self, pagination: Pagination, active_only: bool) -> Result<Page<Plan>> {
        let table = self.tables.plans.read().unwrap();
        let items: Vec<_> = table
            .values()
            .filter(|p| !active_only || p.active)
            .cloned()
            .collect();
        Ok(page_by_created_at(items, pagination, |p| p.created_at))
    }
}

#[async_trait]
impl PriceRepository for MemoryStorage {
    async fn create(&self, price: Price) -> Result<Price> {
        self.tables
            .prices
            .write()
            .unwrap()
            .insert(price.id, price.clone());
        Ok(price)
    }

    async fn save(&self, mut price: Price) -> Result<Price> {
        let mut table = self.tables.prices.write().unwrap();
        if !table.contains_key(&price.id) {
            return Err(Error::not_found(format!("Price {} not found", price.id)));
        }
        price.updated_at = self.clock.now();
        table.insert(price.id, price.clone());
        Ok(price)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Price>> {
        Ok(self.tables.prices.read().unwrap().get(&id).cloned())
    }

    async fn list_by_plan(&self, plan_id: Uuid) -> Result<Vec<Price>> {
        let table = self.tables.prices.read().unwrap();
        let mut prices: Vec<_> = table
            .values()
            .filter(|p| p.plan_id == plan_id)
            .cloned()
            .collect();
        prices.sort_by_key(|p| p.created_at);
        Ok(prices)
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryStorage {
    async fn create(&self, subscription: Subscription) -> Result<Subscription> {
        self.tables
            .subscriptions
            .write()
            .unwrap()
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn save(&self, mut subscription: Subscription) -> Result<Subscription> {
        let mut table = self.tables.subscriptions.write().unwrap();
        if !table.contains_key(&subscription.id) {
            return Err(Error::not_found(format!(
                "Subscription {} not found",
                subscription.id
            )));
        }
        subscription.updated_at = self.clock.now();
        table.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Subscription>> {
        Ok(self.tables.subscriptions.read().unwrap().get(&id).cloned())
    }

    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<Subscription>> {
        let table = self.tables.subscriptions.read().unwrap();
        let mut subs: Vec<_> = table
            .values()
            .filter(|s| s.customer_id == customer_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        Ok(subs)
    }

    async fn find_active_by_customer(&self, customer_id: Uuid) -> Result<Option<Subscription>> {
        let table = self.tables.subscriptions.read().unwrap();
        Ok(table
            .values()
            .find(|s| s.customer_id == customer_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<Subscription>> {
        let table = self.tables.subscriptions.read().unwrap();
        let items: Vec<_> = table.values().cloned().collect();
        Ok(page_by_created_at(items, pagination, |s| s.created_at))
    }

    async fn due_for_renewal(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let table = self.tables.subscriptions.read().unwrap();
        let mut subs: Vec<_> = table
            .values()
            .filter(|s| {
                s.status == SubscriptionStatus::Active
                    && !s.cancel_at_period_end
                    && s.current_period_end <= now
            })
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.current_period_end);
        Ok(subs)
    }

    async fn list_by_status(&self, status: SubscriptionStatus) -> Result<Vec<Subscription>> {
        let table = self.tables.subscriptions.read().unwrap();
        let mut subs: Vec<_> = table
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }
}

#[async_trait]
impl PaymentRepository for MemoryStorage {
    async fn create(&self, payment: Payment) -> Result<Payment> {
        self.tables
            .payments
            .write()
            .unwrap()
            .insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn save(&self, mut payment: Payment) -> Result<Payment> {
        let mut table = self.tables.payments.write().unwrap();
        if !table.contains_key(&payment.id) {
            return Err(Error::not_found(format!(
                "Payment {} not found",
                payment.id
            )));
        }
        payment.updated_at = self.clock.now();
        table.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>> {
        Ok(self.tables.payments.read().unwrap().get(&id).cloned())
    }

    async fn find_by_provider_payment_id(
        &self,
        provider_payment_id: &str,
    ) -> Result<Option<Payment>> {
        let table = self.tables.payments.read().unwrap();
        Ok(table
            .values()
            .find(|p| p.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Payment>> {
        let table = self.tables.payments.read().unwrap();
        Ok(table
            .values()
            .find(|p| p.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn list_by_customer(
        &self,
        customer_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<Payment>> {
        let table = self.tables.payments.read().unwrap();
        let items: Vec<_> = table
            .values()
            .filter(|p| p.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(page_by_created_at(items, pagination, |p| p.created_at))
    }

    async fn list_in_period(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        let table = self.tables.payments.read().unwrap();
        let mut payments: Vec<_> = table
            .values()
            .filter(|p| p.created_at >= from && p.created_at < to)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }
}

#[async_trait]
impl RefundRepository for MemoryStorage {
    async fn create(&self, refund: Refund) -> Result<Refund> {
        self.tables
            .refunds
            .write()
            .unwrap()
            .insert(refund.id, refund.clone());
        Ok(refund)
    }

    async fn list_by_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>> {
        let table = self.tables.refunds.read().unwrap();
        let mut refunds: Vec<_> = table
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| r.created_at);
        Ok(refunds)
    }
}

#[async_trait]
impl PaymentMethodRepository for MemoryStorage {
    async fn create(&self, method: PaymentMethod) -> Result<PaymentMethod> {
        let mut table = self.tables.payment_methods.write().unwrap();
        if method.is_default {
            for other in table.values_mut() {
                if other.customer_id == method.customer_id {
                    other.is_default = false;
                }
            }
        }
        table.insert(method.id, method.clone());
        Ok(method)
    }

    async fn save(&self, mut method: PaymentMethod) -> Result<PaymentMethod> {
        let mut table = self.tables.payment_methods.write().unwrap();
        if !table.contains_key(&method.id) {
            return Err(Error::not_found(format!(
                "Payment method {} not found",
                method.id
            )));
        }
        method.updated_at = self.clock.now();
        table.insert(method.id, method.clone());
        Ok(method)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentMethod>> {
        Ok(self.tables.payment_methods.read().unwrap().get(&id).cloned())
    }

    async fn list_by_customer(&self, customer_id: Uuid) -> Result<Vec<PaymentMethod>> {
        let table = self.tables.payment_methods.read().unwrap();
        let mut methods: Vec<_> = table
            .values()
            .filter(|m| m.customer_id == customer_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| std::cmp::Reverse(m.created_at));
        Ok(methods)
    }

    async fn default_for_customer(&self, customer_id: Uuid) -> Result<Option<PaymentMethod>> {
        let table = self.tables.payment_methods.read().unwrap();
        Ok(table
            .values()
            .find(|m| m.customer_id == customer_id && m.is_default)
            .cloned())
    }

    async fn set_default(
        &self,
        customer_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<PaymentMethod> {
        let mut table = self.tables.payment_methods.write().unwrap();

        let target = table
            .get(&payment_method_id)
            .ok_or_else(|| {
                Error::not_found(format!("Payment method {} not found", payment_method_id))
            })?
            .clone();
        if target.customer_id != customer_id {
            return Err(Error::validation(
                "Payment method does not belong to this customer",
            ));
        }

        let now = self.clock.now();
        for method in table.values_mut() {
            if method.customer_id == customer_id {
                let make_default = method.id == payment_method_id;
                if method.is_default != make_default {
                    method.is_default = make_default;
                    method.updated_at = now;
                }
            }
        }

        Ok(table.get(&payment_method_id).cloned().unwrap())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .tables
            .payment_methods
            .write()
            .unwrap()
            .remove(&id)
            .is_some())
    }
}

#[async_trait]
impl InvoiceRepository for MemoryStorage {
    async fn create(&self, invoice: Invoice) -> Result<Invoice> {
        let mut table = self.tables.invoices.write().unwrap();
        if table.values().any(|i| i.number == invoice.number) {
            return Err(Error::conflict(format!(
                "Invoice number {} already exists",
                invoice.number
            )));
        }
        table.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn save(&self, mut invoice: Invoice) -> Result<Invoice> {
        let mut table = self.tables.invoices.write().unwrap();
        if !table.contains_key(&invoice.id) {
            return Err(Error::not_found(format!(
                "Invoice {} not found",
                invoice.id
            )));
        }
        invoice.updated_at = self.clock.now();
        table.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Invoice>> {
        Ok(self.tables.invoices.read().unwrap().get(&id).cloned())
    }

    async fn find_by_number(&self, number: &str) -> Result<Option<Invoice>> {
        let table = self.tables.invoices.read().unwrap();
        Ok(table.values().find(|i| i.number == number).cloned())
    }

    async fn list_by_customer(
        &self,
        customer_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<Invoice>> {
        let table = self.tables.invoices.read().unwrap();
        let items: Vec<_> = table
            .values()
            .filter(|i| i.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(page_by_created_at(items, pagination, |i| i.created_at))
    }

    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<Invoice>> {
        let table = self.tables.invoices.read().unwrap();
        let mut invoices: Vec<_> = table
            .values()
            .filter(|i| i.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }

    async fn next_number(&self) -> Result<String> {
        let seq = self.invoice_seq.fetch_add(1, Ordering::SeqCst);
        Ok(format!("INV-{:06}", seq))
    }
}

#[async_trait]
impl PromoCodeRepository for MemoryStorage {
    async fn create(&self, promo: PromoCode) -> Result<PromoCode> {
        let mut table = self.tables.promo_codes.write().unwrap();
        if table
            .values()
            .any(|p| p.code.eq_ignore_ascii_case(&promo.code))
        {
            return Err(Error::conflict(format!(
                "Promo code {} already exists",
                promo.code
            )));
        }
        table.insert(promo.id, promo.clone());
        Ok(promo)
    }

    async fn save(&self, mut promo: PromoCode) -> Result<PromoCode> {
        let mut table = self.tables.promo_codes.write().unwrap();
        if !table.contains_key(&promo.id) {
            return Err(Error::not_found(format!("Promo code {} not found", promo.id)));
        }
        promo.updated_at = self.clock.now();
        table.insert(promo.id, promo.clone());
        Ok(promo)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PromoCode>> {
        Ok(self.tables.promo_codes.read().unwrap().get(&id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<PromoCode>> {
        let table = self.tables.promo_codes.read().unwrap();
        Ok(table
            .values()
            .find(|p| p.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<PromoCode>> {
        let table = self.tables.promo_codes.read().unwrap();
        let items: Vec<_> = table.values().cloned().collect();
        Ok(page_by_created_at(items, pagination, |p| p.created_at))
    }

    async fn redeem(&self, id: Uuid, customer_id: Uuid) -> Result<PromoCode> {
        // Both tables are mutated under the promo table's write lock, which
        // serializes redemptions per promo id.
        let mut table = self.tables.promo_codes.write().unwrap();
        let mut redemptions = self.tables.promo_redemptions.write().unwrap();

        let promo = table
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("Promo code {} not found", id)))?;

        if let Some(max) = promo.max_redemptions {
            if promo.current_redemptions >= max {
                return Err(Error::conflict(format!(
                    "Promo code {} has reached its redemption limit",
                    promo.code
                )));
            }
        }

        let customer_count = redemptions
            .get(&id)
            .and_then(|by_customer| by_customer.get(&customer_id))
            .copied()
            .unwrap_or(0);
        if let Some(per_customer) = promo.max_redemptions_per_customer {
            if customer_count >= per_customer {
                return Err(Error::forbidden(format!(
                    "Promo code {} already redeemed the maximum times by this customer",
                    promo.code
                )));
            }
        }

        promo.current_redemptions += 1;
        promo.updated_at = self.clock.now();
        *redemptions
            .entry(id)
            .or_default()
            .entry(customer_id)
            .or_insert(0) += 1;

        Ok(promo.clone())
    }

    async fn customer_redemption_count(&self, id: Uuid, customer_id: Uuid) -> Result<i64> {
        let redemptions = self.tables.promo_redemptions.read().unwrap();
        Ok(redemptions
            .get(&id)
            .and_then(|by_customer| by_customer.get(&customer_id))
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl AutomaticDiscountRepository for MemoryStorage {
    async fn create(&self, discount: AutomaticDiscount) -> Result<AutomaticDiscount> {
        self.tables
            .automatic_discounts
            .write()
            .unwrap()
            .insert(discount.id, discount.clone());
        Ok(discount)
    }

    async fn save(&self, mut discount: AutomaticDiscount) -> Result<AutomaticDiscount> {
        let mut table = self.tables.automatic_discounts.write().unwrap();
        if !table.contains_key(&discount.id) {
            return Err(Error::not_found(format!(
                "Automatic discount {} not found",
                discount.id
            )));
        }
        discount.updated_at = self.clock.now();
        table.insert(discount.id, discount.clone());
        Ok(discount)
    }

    async fn list_active(&self) -> Result<Vec<AutomaticDiscount>> {
        let table = self.tables.automatic_discounts.read().unwrap();
        let mut discounts: Vec<_> = table.values().filter(|d| d.active).cloned().collect();
        discounts.sort_by_key(|d| std::cmp::Reverse(d.priority));
        Ok(discounts)
    }
}

#[async_trait]
impl EntitlementRepository for MemoryStorage {
    async fn define(&self, definition: EntitlementDefinition) -> Result<EntitlementDefinition> {
        self.tables
            .entitlement_defs
            .write()
            .unwrap()
            .insert(definition.key.clone(), definition.clone());
        Ok(definition)
    }

    async fn find_definition(&self, key: &str) -> Result<Option<EntitlementDefinition>> {
        Ok(self.tables.entitlement_defs.read().unwrap().get(key).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<EntitlementDefinition>> {
        let table = self.tables.entitlement_defs.read().unwrap();
        let mut defs: Vec<_> = table.values().cloned().collect();
        defs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(defs)
    }

    async fn upsert_grant(&self, grant: EntitlementGrant) -> Result<EntitlementGrant> {
        let mut table = self.tables.entitlement_grants.write().unwrap();
        let key = (grant.customer_id, grant.entitlement_key.clone());
        match table.get_mut(&key) {
            Some(existing) => {
                existing.merge_regrant(&grant);
                Ok(existing.clone())
            }
            None => {
                table.insert(key, grant.clone());
                Ok(grant)
            }
        }
    }

    async fn find_grant(&self, customer_id: Uuid, key: &str) -> Result<Option<EntitlementGrant>> {
        let table = self.tables.entitlement_grants.read().unwrap();
        Ok(table.get(&(customer_id, key.to_string())).cloned())
    }

    async fn list_grants(&self, customer_id: Uuid) -> Result<Vec<EntitlementGrant>> {
        let table = self.tables.entitlement_grants.read().unwrap();
        let mut grants: Vec<_> = table
            .values()
            .filter(|g| g.customer_id == customer_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| a.entitlement_key.cmp(&b.entitlement_key));
        Ok(grants)
    }

    async fn revoke(&self, customer_id: Uuid, key: &str) -> Result<bool> {
        let mut table = self.tables.entitlement_grants.write().unwrap();
        Ok(table.remove(&(customer_id, key.to_string())).is_some())
    }
}

#[async_trait]
impl LimitRepository for MemoryStorage {
    async fn define(&self, definition: LimitDefinition) -> Result<LimitDefinition> {
        self.tables
            .limit_defs
            .write()
            .unwrap()
            .insert(definition.key.clone(), definition.clone());
        Ok(definition)
    }

    async fn find_definition(&self, key: &str) -> Result<Option<LimitDefinition>> {
        Ok(self.tables.limit_defs.read().unwrap().get(key).cloned())
    }

    async fn set_limit(&self, limit: CustomerLimit) -> Result<CustomerLimit> {
        self.tables
            .customer_limits
            .write()
            .unwrap()
            .insert((limit.customer_id, limit.limit_key.clone()), limit.clone());
        Ok(limit)
    }

    async fn find_limit(&self, customer_id: Uuid, key: &str) -> Result<Option<CustomerLimit>> {
        let table = self.tables.customer_limits.read().unwrap();
        Ok(table.get(&(customer_id, key.to_string())).cloned())
    }

    async fn list_limits(&self, customer_id: Uuid) -> Result<Vec<CustomerLimit>> {
        let table = self.tables.customer_limits.read().unwrap();
        let mut limits: Vec<_> = table
            .values()
            .filter(|l| l.customer_id == customer_id)
            .cloned()
            .collect();
        limits.sort_by(|a, b| a.limit_key.cmp(&b.limit_key));
        Ok(limits)
    }

    async fn try_consume(
        &self,
        customer_id: Uuid,
        key: &str,
        quantity: i64,
    ) -> Result<CustomerLimit> {
        if quantity < 0 {
            return Err(Error::validation("quantity must be non-negative"));
        }
        let mut table = self.tables.customer_limits.write().unwrap();
        let limit = table
            .get_mut(&(customer_id, key.to_string()))
            .ok_or_else(|| {
                Error::not_found(format!("Limit {} not set for customer {}", key, customer_id))
            })?;

        if !limit.is_allowed() {
            return Err(Error::forbidden(format!("Limit {} exhausted", key)));
        }

        limit.current_value += quantity;
        Ok(limit.clone())
    }

    async fn set_current(
        &self,
        customer_id: Uuid,
        key: &str,
        value: i64,
    ) -> Result<CustomerLimit> {
        if value < 0 {
            return Err(Error::validation("current value must be non-negative"));
        }
        let mut table = self.tables.customer_limits.write().unwrap();
        let limit = table
            .get_mut(&(customer_id, key.to_string()))
            .ok_or_else(|| {
                Error::not_found(format!("Limit {} not set for customer {}", key, customer_id))
            })?;
        limit.current_value = value;
        Ok(limit.clone())
    }
}

#[async_trait]
impl UsageRepository for MemoryStorage {
    async fn record(&self, usage: UsageRecord) -> Result<UsageRecord> {
        self.tables.usage_records.write().unwrap().push(usage.clone());
        Ok(usage)
    }

    async fn list_by_subscription(&self, subscription_id: Uuid) -> Result<Vec<UsageRecord>> {
        let table = self.tables.usage_records.read().unwrap();
        Ok(table
            .iter()
            .filter(|u| u.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl VendorRepository for MemoryStorage {
    async fn create(&self, vendor: Vendor) -> Result<Vendor> {
        self.tables
            .vendors
            .write()
            .unwrap()
            .insert(vendor.id, vendor.clone());
        Ok(vendor)
    }

    async fn save(&self, mut vendor: Vendor) -> Result<Vendor> {
        let mut table = self.tables.vendors.write().unwrap();
        if !table.contains_key(&vendor.id) {
            return Err(Error::not_found(format!("Vendor {} not found", vendor.id)));
        }
        vendor.updated_at = self.clock.now();
        table.insert(vendor.id, vendor.clone());
        Ok(vendor)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Vendor>> {
        Ok(self.tables.vendors.read().unwrap().get(&id).cloned())
    }

    async fn list(&self, pagination: Pagination) -> Result<Page<Vendor>> {
        let table = self.tables.vendors.read().unwrap();
        let items: Vec<_> = table.values().cloned().collect();
        Ok(page_by_created_at(items, pagination, |v| v.created_at))
    }
}

#[async_trait]
impl PayoutRepository for MemoryStorage {
    async fn create(&self, payout: VendorPayout) -> Result<VendorPayout> {
        self.tables
            .payouts
            .write()
            .unwrap()
            .insert(payout.id, payout.clone());
        Ok(payout)
    }

    async fn save(&self, payout: VendorPayout) -> Result<VendorPayout> {
        let mut table = self.tables.payouts.write().unwrap();
        if !table.contains_key(&payout.id) {
            return Err(Error::not_found(format!("Payout {} not found", payout.id)));
        }
        table.insert(payout.id, payout.clone());
        Ok(payout)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VendorPayout>> {
        Ok(self.tables.payouts.read().unwrap().get(&id).cloned())
    }

    async fn list_by_vendor(&self, vendor_id: Uuid) -> Result<Vec<VendorPayout>> {
        let table = self.tables.payouts.read().unwrap();
        let mut payouts: Vec<_> = table
            .values()
            .filter(|p| p.vendor_id == vendor_id)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.scheduled_at);
        Ok(payouts)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<VendorPayout>> {
        let table = self.tables.payouts.read().unwrap();
        let mut payouts: Vec<_> = table
            .values()
            .filter(|p| {
                p.status == crate::models::PayoutStatus::Scheduled && p.scheduled_at <= now
            })
            .cloned()
            .collect();
        payouts.sort_by_key(|p| p.scheduled_at);
        Ok(payouts)
    }
}

#[async_trait]
impl AddOnRepository for MemoryStorage {
    async fn create(&self, addon: AddOn) -> Result<AddOn> {
        self.tables
            .addons
            .write()
            .unwrap()
            .insert(addon.id, addon.clone());
        Ok(addon)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AddOn>> {
        Ok(self.tables.addons.read().unwrap().get(&id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<AddOn>> {
        let table = self.tables.addons.read().unwrap();
        Ok(table.values().filter(|a| a.active).cloned().collect())
    }
}

#[async_trait]
impl SubscriptionAddOnRepository for MemoryStorage {
    async fn attach(&self, addon: SubscriptionAddOn) -> Result<SubscriptionAddOn> {
        self.tables
            .subscription_addons
            .write()
            .unwrap()
            .insert(addon.id, addon.clone());
        Ok(addon)
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<SubscriptionAddOn>> {
        let table = self.tables.subscription_addons.read().unwrap();
        Ok(table
            .values()
            .filter(|a| a.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn detach(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .tables
            .subscription_addons
            .write()
            .unwrap()
            .remove(&id)
            .is_some())
    }
}

#[async_trait]
impl JobRepository for MemoryStorage {
    async fn enqueue(&self, job: Job) -> Result<Job> {
        self.tables.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn save(&self, mut job: Job) -> Result<Job> {
        let mut table = self.tables.jobs.write().unwrap();
        if !table.contains_key(&job.id) {
            return Err(Error::not_found(format!("Job {} not found", job.id)));
        }
        job.updated_at = self.clock.now();
        table.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.tables.jobs.read().unwrap().get(&id).cloned())
    }

    async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let table = self.tables.jobs.read().unwrap();
        let mut jobs: Vec<_> = table
            .values()
            .filter(|j| j.is_ready(now))
            .cloned()
            .collect();
        sort_by_priority(&mut jobs);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let table = self.tables.jobs.read().unwrap();
        let mut jobs: Vec<_> = table
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.scheduled_at);
        Ok(jobs)
    }
}

#[async_trait]
impl WebhookEventRepository for MemoryStorage {
    async fn insert_if_new(
        &self,
        event: WebhookEventRecord,
    ) -> Result<Option<WebhookEventRecord>> {
        let mut table = self.tables.webhook_events.write().unwrap();
        if table
            .values()
            .any(|e| e.provider_event_id == event.provider_event_id)
        {
            return Ok(None);
        }
        table.insert(event.id, event.clone());
        Ok(Some(event))
    }

    async fn find_by_provider_event_id(
        &self,
        provider_event_id: &str,
    ) -> Result<Option<WebhookEventRecord>> {
        let table = self.tables.webhook_events.read().unwrap();
        Ok(table
            .values()
            .find(|e| e.provider_event_id == provider_event_id)
            .cloned())
    }

    async fn save(&self, event: WebhookEventRecord) -> Result<WebhookEventRecord> {
        let mut table = self.tables.webhook_events.write().unwrap();
        if !table.contains_key(&event.id) {
            return Err(Error::not_found(format!(
                "Webhook event {} not found",
                event.id
            )));
        }
        table.insert(event.id, event.clone());
        Ok(event)
    }

    async fn list_by_status(
        &self,
        status: WebhookEventStatus,
    ) -> Result<Vec<WebhookEventRecord>> {
        let table = self.tables.webhook_events.read().unwrap();
        let mut events: Vec<_> = table
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }
}

#[async_trait]
impl IdempotencyRepository for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let table = self.tables.idempotency.read().unwrap();
        Ok(table
            .get(key)
            .filter(|r| !r.is_expired(self.clock.now()))
            .cloned())
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<IdempotencyRecord> {
        self.tables
            .idempotency
            .write()
            .unwrap()
            .insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut table = self.tables.idempotency.write().unwrap();
        let before = table.len();
        table.retain(|_, r| !r.is_expired(now));
        Ok((before - table.len()) as u64)
    }
}

#[async_trait]
impl AuditLogRepository for MemoryStorage {
    async fn append(&self, entry: AuditLog) -> Result<AuditLog> {
        self.tables.audit_logs.write().unwrap().push(entry.clone());
        Ok(entry)
    }

    async fn list_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        pagination: Pagination,
    ) -> Result<Page<AuditLog>> {
        let table = self.tables.audit_logs.read().unwrap();
        let items: Vec<_> = table
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect();
        Ok(page_by_created_at(items, pagination, |e| e.at))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn customers(&self) -> &dyn CustomerRepository {
        self
    }
    fn plans(&self) -> &dyn PlanRepository {
        self
    }
    fn prices(&self) -> &dyn PriceRepository {
        self
    }
    fn subscriptions(&self) -> &dyn SubscriptionRepository {
        self
    }
    fn payments(&self) -> &dyn PaymentRepository {
        self
    }
    fn refunds(&self) -> &dyn RefundRepository {
        self
    }
    fn payment_methods(&self) -> &dyn PaymentMethodRepository {
        self
    }
    fn invoices(&self) -> &dyn InvoiceRepository {
        self
    }
    fn promo_codes(&self) -> &dyn PromoCodeRepository {
        self
    }
    fn automatic_discounts(&self) -> &dyn AutomaticDiscountRepository {
        self
    }
    fn entitlements(&self) -> &dyn EntitlementRepository {
        self
    }
    fn limits(&self) -> &dyn LimitRepository {
        self
    }
    fn usage(&self) -> &dyn UsageRepository {
        self
    }
    fn vendors(&self) -> &dyn VendorRepository {
        self
    }
    fn payouts(&self) -> &dyn PayoutRepository {
        self
    }
    fn addons(&self) -> &dyn AddOnRepository {
        self
    }
    fn subscription_addons(&self) -> &dyn SubscriptionAddOnRepository {
        self
    }
    fn jobs(&self) -> &dyn JobRepository {
        self
    }
    fn webhook_events(&self) -> &dyn WebhookEventRepository {
        self
    }
    fn idempotency(&self) -> &dyn IdempotencyRepository {
        self
    }
    fn audit_logs(&self) -> &dyn AuditLogRepository {
        self
    }

    async fn transaction<'a>(&'a self, work: TxWork<'a>) -> Result<()> {
        let _guard = self.tx_lock.lock().await;
        work(self).await
    }

    async fn ping(&self) -> Result<()> {
        let _ = self.tables.customers.read().unwrap().len();
        Ok(())
    }
}
