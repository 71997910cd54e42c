//! Invoice operations

use uuid::Uuid;

use crate::{
    common::{Page, Pagination},
    events::{BillingEvent, BillingEventType},
    models::{Invoice, InvoiceLine},
    storage::Storage,
    Error, Result,
};

use super::QzPay;

impl QzPay {
    /// Create an open invoice from lines; totals derive from the lines and
    /// the supplied discount and tax amounts.
    pub async fn create_invoice(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        currency: Option<String>,
        lines: Vec<(String, i64, i64)>,
        discount: i64,
        tax: i64,
    ) -> Result<Invoice> {
        if lines.is_empty() {
            return Err(Error::validation("an invoice needs at least one line"));
        }
        for (_, quantity, unit_amount) in &lines {
            if *quantity < 1 {
                return Err(Error::validation("line quantity must be at least 1"));
            }
            if *unit_amount < 0 {
                return Err(Error::validation("line unit_amount must be non-negative"));
            }
        }

        self.get_customer(customer_id).await?;

        let id = Uuid::new_v4();
        let invoice_lines: Vec<InvoiceLine> = lines
            .into_iter()
            .map(|(description, quantity, unit_amount)| {
                InvoiceLine::new(id, description, quantity, unit_amount)
            })
            .collect();

        let number = self.storage().invoices().next_number().await?;
        let mut invoice = Invoice::open(
            id,
            customer_id,
            subscription_id,
            number,
            currency.unwrap_or_else(|| self.config().billing.default_currency.clone()),
            invoice_lines,
            discount,
            tax,
            self.now(),
        )?;
        invoice.livemode = self.livemode();

        let invoice = self.storage().invoices().create(invoice).await?;
        self.audit("invoice", invoice.id, "created", None, serde_json::to_value(&invoice).ok())
            .await;
        Ok(invoice)
    }

    pub async fn get_invoice(&self, id: Uuid) -> Result<Invoice> {
        self.storage()
            .invoices()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Invoice {} not found", id)))
    }

    pub async fn get_invoice_by_number(&self, number: &str) -> Result<Invoice> {
        self.storage()
            .invoices()
            .find_by_number(number)
            .await?
            .ok_or_else(|| Error::not_found(format!("Invoice {} not found", number)))
    }

    pub async fn list_customer_invoices(
        &self,
        customer_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<Invoice>> {
        self.storage()
            .invoices()
            .list_by_customer(customer_id, pagination)
            .await
    }

    /// Record a payment toward an open invoice. Full payment flips it to
    /// paid and emits `invoice.paid`.
    pub async fn pay_invoice(&self, id: Uuid, amount: i64) -> Result<Invoice> {
        let mut invoice = self.get_invoice(id).await?;
        let now = self.now();
        invoice.apply_payment(amount, now)?;
        let invoice = self.storage().invoices().save(invoice).await?;

        if invoice.paid_at.is_some() {
            self.emit(
                BillingEvent::new(BillingEventType::InvoicePaid, now)
                    .with_customer(invoice.customer_id)
                    .with_data(serde_json::json!({
                        "invoice_id": invoice.id,
                        "number": invoice.number,
                        "total": invoice.total,
                    })),
            );
        }

        Ok(invoice)
    }

    pub async fn void_invoice(&self, id: Uuid) -> Result<Invoice> {
        let mut invoice = self.get_invoice(id).await?;
        invoice.void(self.now())?;
        let invoice = self.storage().invoices().save(invoice).await?;
        self.audit("invoice", invoice.id, "voided", None, None).await;
        Ok(invoice)
    }
}
