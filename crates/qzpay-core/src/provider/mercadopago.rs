//! MercadoPago provider adapter
//!
//! JSON client over the MercadoPago REST API. Payment rejections surface as
//! `Failed` records carrying the `status_detail` code; the IPN verifier uses
//! the shared `ts=..,v1=..` HMAC scheme MercadoPago signs notifications with.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    clock::Clock,
    models::ProviderKind,
    webhooks::HmacSignatureVerifier,
    Error, Result,
};

use super::{
    PaymentProvider, ProviderCheckout, ProviderCheckoutRequest, ProviderCustomer,
    ProviderCustomerRequest, ProviderPayment, ProviderPaymentRequest, ProviderPaymentStatus,
    ProviderPrice, ProviderPriceRequest, ProviderRefund, ProviderSubscription,
    ProviderSubscriptionRequest, WebhookVerifier,
};

const API_BASE: &str = "https://api.mercadopago.com";

pub struct MercadoPagoProvider {
    access_token: String,
    client: reqwest::Client,
    verifier: HmacSignatureVerifier,
}

impl MercadoPagoProvider {
    pub fn new(
        access_token: String,
        webhook_secret: Option<String>,
        tolerance_seconds: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            access_token,
            client: reqwest::Client::new(),
            verifier: HmacSignatureVerifier::new(webhook_secret, tolerance_seconds, clock),
        }
    }

    fn map_status(status: &str) -> ProviderPaymentStatus {
        match status {
            "approved" => ProviderPaymentStatus::Succeeded,
            "rejected" => ProviderPaymentStatus::Failed,
            "cancelled" => ProviderPaymentStatus::Canceled,
            "refunded" | "charged_back" => ProviderPaymentStatus::Refunded,
            "in_process" | "pending" | "authorized" => ProviderPaymentStatus::Pending,
            _ => ProviderPaymentStatus::Pending,
        }
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.access_token))
            .send()
            .await
            .map_err(|e| Error::provider_unavailable(format!("MercadoPago API error: {}", e)))?;

        if response.status().as_u16() == 404 {
            return Err(Error::not_found("MercadoPago: no such resource"));
        }
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::provider_unavailable(format!(
                "MercadoPago error ({}): {}",
                status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            Error::provider_unavailable(format!("MercadoPago response decode error: {}", e))
        })
    }
}

#[async_trait]
impl PaymentProvider for MercadoPagoProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MercadoPago
    }

    async fn create_customer(
        &self,
        request: ProviderCustomerRequest,
    ) -> Result<ProviderCustomer> {
        let body = serde_json::json!({
            "email": request.email,
            "first_name": request.name,
        });

        let customer: MpCustomer = self
            .send_json(
                self.client
                    .post(format!("{}/v1/customers", API_BASE))
                    .json(&body),
            )
            .await?;

        Ok(ProviderCustomer {
            id: customer.id,
            email: customer.email,
        })
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
        let customer: MpCustomer = self
            .send_json(
                self.client
                    .get(format!("{}/v1/customers/{}", API_BASE, customer_id)),
            )
            .await?;

        Ok(ProviderCustomer {
            id: customer.id,
            email: customer.email,
        })
    }

    async fn create_payment(&self, request: ProviderPaymentRequest) -> Result<ProviderPayment> {
        // MercadoPago expects major units with decimals
        let transaction_amount = request.amount as f64 / 100.0;

        let body = serde_json::json!({
            "transaction_amount": transaction_amount,
            "currency_id": request.currency,
            "description": request.description,
            "payer": { "id": request.customer_id },
            "token": request.payment_method_id,
            "metadata": request.metadata,
        });

        let mut builder = self
            .client
            .post(format!("{}/v1/payments", API_BASE))
            .json(&body);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header("X-Idempotency-Key", key.clone());
        }

        let payment: MpPayment = self.send_json(builder).await?;
        let status = Self::map_status(&payment.status);

        Ok(ProviderPayment {
            id: payment.id.to_string(),
            status,
            amount: request.amount,
            currency: request.currency,
            failure_code: (status == ProviderPaymentStatus::Failed)
                .then(|| payment.status_detail.clone())
                .flatten(),
            failure_message: (status == ProviderPaymentStatus::Failed)
                .then(|| payment.status_detail)
                .flatten(),
        })
    }

    async fn capture_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
    ) -> Result<ProviderPayment> {
        let mut body = serde_json::json!({ "capture": true });
        if let Some(amount) = amount {
            body["transaction_amount"] = serde_json::json!(amount as f64 / 100.0);
        }

        let payment: MpPayment = self
            .send_json(
                self.client
                    .put(format!("{}/v1/payments/{}", API_BASE, payment_id))
                    .json(&body),
            )
            .await?;

        Ok(ProviderPayment {
            id: payment.id.to_string(),
            status: Self::map_status(&payment.status),
            amount: amount.unwrap_or_default(),
            currency: payment.currency_id.unwrap_or_default(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        _reason: Option<&str>,
    ) -> Result<ProviderRefund> {
        let body = match amount {
            Some(amount) => serde_json::json!({ "amount": amount as f64 / 100.0 }),
            None => serde_json::json!({}),
        };

        let refund: MpRefund = self
            .send_json(
                self.client
                    .post(format!("{}/v1/payments/{}/refunds", API_BASE, payment_id))
                    .json(&body),
            )
            .await?;

        Ok(ProviderRefund {
            id: refund.id.to_string(),
            payment_id: payment_id.to_string(),
            amount: amount.unwrap_or((refund.amount.unwrap_or(0.0) * 100.0).round() as i64),
            status: ProviderPaymentStatus::Succeeded,
        })
    }

    async fn cancel_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        let payment: MpPayment = self
            .send_json(
                self.client
                    .put(format!("{}/v1/payments/{}", API_BASE, payment_id))
                    .json(&serde_json::json!({ "status": "cancelled" })),
            )
            .await?;

        Ok(ProviderPayment {
            id: payment.id.to_string(),
            status: Self::map_status(&payment.status),
            amount: 0,
            currency: payment.currency_id.unwrap_or_default(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        let payment: MpPayment = self
            .send_json(
                self.client
                    .get(format!("{}/v1/payments/{}", API_BASE, payment_id)),
            )
            .await?;

        let amount = (payment.transaction_amount.unwrap_or(0.0) * 100.0).round() as i64;
        Ok(ProviderPayment {
            id: payment.id.to_string(),
            status: Self::map_status(&payment.status),
            amount,
            currency: payment.currency_id.unwrap_or_default(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn create_subscription(
        &self,
        request: ProviderSubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        let body = serde_json::json!({
            "preapproval_plan_id": request.price_id,
            "payer_email": request.customer_id,
            "quantity": request.quantity,
            "status": "authorized",
        });

        let preapproval: MpPreapproval = self
            .send_json(
                self.client
                    .post(format!("{}/preapproval", API_BASE))
                    .json(&body),
            )
            .await?;

        Ok(ProviderSubscription {
            id: preapproval.id,
            status: preapproval.status,
            current_period_end: None,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        let preapproval: MpPreapproval = self
            .send_json(
                self.client
                    .put(format!("{}/preapproval/{}", API_BASE, subscription_id))
                    .json(&serde_json::json!({ "status": "cancelled" })),
            )
            .await?;

        Ok(ProviderSubscription {
            id: preapproval.id,
            status: preapproval.status,
            current_period_end: None,
        })
    }

    async fn create_checkout_session(
        &self,
        request: ProviderCheckoutRequest,
    ) -> Result<ProviderCheckout> {
        let body = serde_json::json!({
            "items": [{
                "id": request.price_id,
                "quantity": request.quantity,
            }],
            "back_urls": {
                "success": request.success_url,
                "failure": request.cancel_url,
            },
            "metadata": request.metadata,
        });

        let preference: MpPreference = self
            .send_json(
                self.client
                    .post(format!("{}/checkout/preferences", API_BASE))
                    .json(&body),
            )
            .await?;

        Ok(ProviderCheckout {
            id: preference.id,
            url: preference.init_point,
            status: "open".to_string(),
        })
    }

    async fn create_price(&self, request: ProviderPriceRequest) -> Result<ProviderPrice> {
        let frequency_type = match request.interval.as_str() {
            "day" => "days",
            _ => "months",
        };
        let body = serde_json::json!({
            "reason": request.product_name,
            "auto_recurring": {
                "frequency": request.interval_count,
                "frequency_type": frequency_type,
                "transaction_amount": request.unit_amount as f64 / 100.0,
                "currency_id": request.currency,
            },
        });

        let plan: MpPreapprovalPlan = self
            .send_json(
                self.client
                    .post(format!("{}/preapproval_plan", API_BASE))
                    .json(&body),
            )
            .await?;

        Ok(ProviderPrice {
            id: plan.id,
            currency: request.currency,
            unit_amount: request.unit_amount,
        })
    }

    fn webhooks(&self) -> &dyn WebhookVerifier {
        &self.verifier
    }
}

// MercadoPago API response types

#[derive(Debug, Deserialize)]
struct MpCustomer {
    id: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MpPayment {
    id: serde_json::Number,
    status: String,
    status_detail: Option<String>,
    transaction_amount: Option<f64>,
    currency_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MpRefund {
    id: serde_json::Number,
    amount: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MpPreapproval {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MpPreference {
    id: String,
    init_point: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MpPreapprovalPlan {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            MercadoPagoProvider::map_status("approved"),
            ProviderPaymentStatus::Succeeded
        );
        assert_eq!(
            MercadoPagoProvider::map_status("rejected"),
            ProviderPaymentStatus::Failed
        );
        assert_eq!(
            MercadoPagoProvider::map_status("refunded"),
            ProviderPaymentStatus::Refunded
        );
        assert_eq!(
            MercadoPagoProvider::map_status("in_process"),
            ProviderPaymentStatus::Pending
        );
    }
}
