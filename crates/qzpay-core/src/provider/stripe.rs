//! Stripe provider adapter
//!
//! Thin reqwest client over the Stripe REST API, mapping responses into the
//! provider-agnostic records the core consumes. Declines come back as
//! `Failed` payments with the provider code, never as errors; transport
//! failures surface as `ProviderUnavailable`.

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

const API_BASE: &str = "https://api.stripe.com/v1";

pub struct StripeProvider {
    api_key: String,
    client: reqwest::Client,
    verifier: HmacSignatureVerifier,
}

impl StripeProvider {
    pub fn new(
        api_key: String,
        webhook_secret: Option<String>,
        tolerance_seconds: i64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            verifier: HmacSignatureVerifier::new(webhook_secret, tolerance_seconds, clock),
        }
    }

    fn map_status(status: &str) -> ProviderPaymentStatus {
        match status {
            "succeeded" => ProviderPaymentStatus::Succeeded,
            "processing" | "requires_capture" => ProviderPaymentStatus::Pending,
            "requires_action" | "requires_confirmation" | "requires_payment_method" => {
                ProviderPaymentStatus::RequiresAction
            }
            "canceled" => ProviderPaymentStatus::Canceled,
            _ => ProviderPaymentStatus::Pending,
        }
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        let mut request = self
            .client
            .post(format!("{}{}", API_BASE, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .form(params);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::provider_unavailable(format!("Stripe API error: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            if status.as_u16() == 404 {
                return Err(Error::not_found(format!("Stripe: {}", error_text)));
            }
            return Err(Error::provider_unavailable(format!(
                "Stripe error ({}): {}",
                status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            Error::provider_unavailable(format!("Stripe response decode error: {}", e))
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", API_BASE, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| Error::provider_unavailable(format!("Stripe API error: {}", e)))?;

        if response.status().as_u16() == 404 {
            return Err(Error::not_found("Stripe: no such resource"));
        }
        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::provider_unavailable(format!(
                "Stripe error: {}",
                error_text
            )));
        }

        response.json().await.map_err(|e| {
            Error::provider_unavailable(format!("Stripe response decode error: {}", e))
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn create_customer(
        &self,
        request: ProviderCustomerRequest,
    ) -> Result<ProviderCustomer> {
        let mut params = vec![("email".to_string(), request.email)];
        if let Some(name) = request.name {
            params.push(("name".to_string(), name));
        }

        let customer: StripeCustomer = self.post_form("/customers", &params, None).await?;
        Ok(ProviderCustomer {
            id: customer.id,
            email: customer.email,
        })
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
        let customer: StripeCustomer =
            self.get_json(&format!("/customers/{}", customer_id)).await?;
        if customer.deleted.unwrap_or(false) {
            return Err(Error::not_found(format!("No such customer: {}", customer_id)));
        }
        Ok(ProviderCustomer {
            id: customer.id,
            email: customer.email,
        })
    }

    async fn create_payment(&self, request: ProviderPaymentRequest) -> Result<ProviderPayment> {
        let mut params = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("confirm".to_string(), "true".to_string()),
            ("off_session".to_string(), "true".to_string()),
        ];
        if let Some(customer_id) = &request.customer_id {
            params.push(("customer".to_string(), customer_id.clone()));
        }
        if let Some(payment_method_id) = &request.payment_method_id {
            params.push(("payment_method".to_string(), payment_method_id.clone()));
        }
        if let Some(description) = &request.description {
            params.push(("description".to_string(), description.clone()));
        }
        if let Some(map) = request.metadata.as_object() {
            for (key, value) in map {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                params.push((format!("metadata[{}]", key), rendered));
            }
        }

        let intent: StripePaymentIntent = self
            .post_form(
                "/payment_intents",
                &params,
                request.idempotency_key.as_deref(),
            )
            .await?;

        let (status, failure_code, failure_message) = match &intent.last_payment_error {
            Some(error) => (
                ProviderPaymentStatus::Failed,
                error.code.clone(),
                error.message.clone(),
            ),
            None => (Self::map_status(&intent.status), None, None),
        };

        Ok(ProviderPayment {
            id: intent.id,
            status,
            amount: intent.amount,
            currency: intent.currency.to_uppercase(),
            failure_code,
            failure_message,
        })
    }

    async fn capture_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
    ) -> Result<ProviderPayment> {
        let mut params = Vec::new();
        if let Some(amount) = amount {
            params.push(("amount_to_capture".to_string(), amount.to_string()));
        }

        let intent: StripePaymentIntent = self
            .post_form(
                &format!("/payment_intents/{}/capture", payment_id),
                &params,
                None,
            )
            .await?;

        Ok(ProviderPayment {
            id: intent.id,
            status: Self::map_status(&intent.status),
            amount: intent.amount,
            currency: intent.currency.to_uppercase(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> Result<ProviderRefund> {
        let mut params = vec![("payment_intent".to_string(), payment_id.to_string())];
        if let Some(amount) = amount {
            params.push(("amount".to_string(), amount.to_string()));
        }
        if let Some(reason) = reason {
            params.push(("reason".to_string(), reason.to_string()));
        }

        let refund: StripeRefund = self.post_form("/refunds", &params, None).await?;
        Ok(ProviderRefund {
            id: refund.id,
            payment_id: payment_id.to_string(),
            amount: refund.amount,
            status: match refund.status.as_deref() {
                Some("succeeded") => ProviderPaymentStatus::Succeeded,
                Some("failed") => ProviderPaymentStatus::Failed,
                Some("canceled") => ProviderPaymentStatus::Canceled,
                _ => ProviderPaymentStatus::Pending,
            },
        })
    }

    async fn cancel_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        let intent: StripePaymentIntent = self
            .post_form(&format!("/payment_intents/{}/cancel", payment_id), &[], None)
            .await?;

        Ok(ProviderPayment {
            id: intent.id,
            status: Self::map_status(&intent.status),
            amount: intent.amount,
            currency: intent.currency.to_uppercase(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        let intent: StripePaymentIntent = self
            .get_json(&format!("/payment_intents/{}", payment_id))
            .await?;

        Ok(ProviderPayment {
            id: intent.id,
            status: Self::map_status(&intent.status),
            amount: intent.amount,
            currency: intent.currency.to_uppercase(),
            failure_code: None,
            failure_message: None,
        })
    }

    async fn create_subscription(
        &self,
        request: ProviderSubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        let mut params = vec![
            ("customer".to_string(), request.customer_id),
            ("items[0][price]".to_string(), request.price_id),
            ("items[0][quantity]".to_string(), request.quantity.to_string()),
        ];
        if let Some(trial_days) = request.trial_days {
            params.push(("trial_period_days".to_string(), trial_days.to_string()));
        }

        let subscription: StripeSubscription =
            self.post_form("/subscriptions", &params, None).await?;

        Ok(ProviderSubscription {
            id: subscription.id,
            status: subscription.status,
            current_period_end: subscription
                .current_period_end
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        let response = self
            .client
            .delete(format!("{}/subscriptions/{}", API_BASE, subscription_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| Error::provider_unavailable(format!("Stripe API error: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::provider_unavailable(format!(
                "Stripe error: {}",
                error_text
            )));
        }

        let subscription: StripeSubscription = response.json().await.map_err(|e| {
            Error::provider_unavailable(format!("Stripe response decode error: {}", e))
        })?;

        Ok(ProviderSubscription {
            id: subscription.id,
            status: subscription.status,
            current_period_end: subscription
                .current_period_end
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        })
    }

    async fn create_checkout_session(
        &self,
        request: ProviderCheckoutRequest,
    ) -> Result<ProviderCheckout> {
        let mut params = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("line_items[0][price]".to_string(), request.price_id),
            (
                "line_items[0][quantity]".to_string(),
                request.quantity.to_string(),
            ),
            ("success_url".to_string(), request.success_url),
            ("cancel_url".to_string(), request.cancel_url),
        ];
        if let Some(customer_id) = request.customer_id {
            params.push(("customer".to_string(), customer_id));
        }

        let session: StripeCheckoutSession =
            self.post_form("/checkout/sessions", &params, None).await?;

        Ok(ProviderCheckout {
            id: session.id,
            url: session.url,
            status: session.status.unwrap_or_else(|| "open".to_string()),
        })
    }

    async fn create_price(&self, request: ProviderPriceRequest) -> Result<ProviderPrice> {
        let params = vec![
            ("currency".to_string(), request.currency.to_lowercase()),
            ("unit_amount".to_string(), request.unit_amount.to_string()),
            (
                "recurring[interval]".to_string(),
                request.interval.clone(),
            ),
            (
                "recurring[interval_count]".to_string(),
                request.interval_count.to_string(),
            ),
            ("product_data[name]".to_string(), request.product_name),
        ];

        let price: StripePrice = self.post_form("/prices", &params, None).await?;
        Ok(ProviderPrice {
            id: price.id,
            currency: price.currency.to_uppercase(),
            unit_amount: price.unit_amount.unwrap_or(request.unit_amount),
        })
    }

    fn webhooks(&self) -> &dyn WebhookVerifier {
        &self.verifier
    }
}

// Stripe API response types

#[derive(Debug, Deserialize)]
struct StripeCustomer {
    id: String,
    email: Option<String>,
    deleted: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    amount: i64,
    currency: String,
    status: String,
    last_payment_error: Option<StripePaymentError>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    amount: i64,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeSubscription {
    id: String,
    status: String,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripePrice {
    id: String,
    currency: String,
    unit_amount: Option<i64>,
}
