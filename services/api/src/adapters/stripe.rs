//! services/api/src/adapters/stripe.rs
//!
//! The `PaymentService` implementation backed by Stripe's REST API, plus
//! verification of the `Stripe-Signature` header on webhook deliveries.

use async_trait::async_trait;
use curriculum_portal_core::ports::{
    CheckoutSession, NewCheckoutSession, NewPaymentIntent, PaymentIntent, PaymentService, PortError, PortResult,
};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::{debug, error, instrument};

const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Webhook deliveries older than this are rejected.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct StripeAdapter {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl std::fmt::Debug for StripeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeAdapter")
            .field("base_url", &self.base_url)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// The subset of a Stripe PaymentIntent object this service reads.
#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    status: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    #[serde(default)]
    last_payment_error: Option<StripeErrorDetail>,
}

impl StripePaymentIntent {
    fn to_domain(self) -> PaymentIntent {
        PaymentIntent {
            id: self.id,
            client_secret: self.client_secret,
            status: self.status,
            amount: self.amount,
            currency: self.currency,
            customer: self.customer,
            metadata: self.metadata,
            last_payment_error: self.last_payment_error.and_then(|e| e.message),
        }
    }
}

/// The subset of a Stripe Checkout Session object this service reads.
#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    payment_intent: Option<String>,
    #[serde(default)]
    livemode: bool,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorResponse {
    error: StripeErrorDetail,
}

impl StripeAdapter {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self::with_base_url(secret_key, STRIPE_API_BASE)
    }

    /// Points the adapter at a different API root, e.g. a local stub.
    pub fn with_base_url(secret_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            secret_key: secret_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Turns a non-success response into a port error carrying Stripe's message.
    async fn failure(response: reqwest::Response) -> PortError {
        let status = response.status();
        let message = response
            .json::<StripeErrorResponse>()
            .await
            .ok()
            .and_then(|body| body.error.message)
            .unwrap_or_else(|| format!("Stripe returned {status}"));
        error!(status = status.as_u16(), message = %message, "Stripe API error");

        match status {
            StatusCode::NOT_FOUND => PortError::NotFound(message),
            StatusCode::BAD_REQUEST | StatusCode::PAYMENT_REQUIRED => PortError::InvalidInput(message),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => PortError::Unavailable(message),
            _ => PortError::Unexpected(message),
        }
    }

    fn transport(e: reqwest::Error) -> PortError {
        error!(error = %e, "Stripe request failed");
        PortError::Unavailable(e.to_string())
    }

    async fn intent_from(response: reqwest::Response) -> PortResult<PaymentIntent> {
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }
        let intent: StripePaymentIntent = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Malformed Stripe response: {e}")))?;
        Ok(intent.to_domain())
    }

    async fn expect_success(response: reqwest::Response) -> PortResult<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::failure(response).await)
        }
    }
}

/// Form fields for an embedded, single line item Checkout session.
fn checkout_form(request: &NewCheckoutSession) -> Vec<(String, String)> {
    let mut form = vec![
        ("ui_mode".to_string(), "embedded".to_string()),
        ("mode".to_string(), "payment".to_string()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("line_items[0][price_data][currency]".to_string(), request.currency.clone()),
        ("line_items[0][price_data][unit_amount]".to_string(), request.unit_amount.to_string()),
        (
            "line_items[0][price_data][product_data][name]".to_string(),
            request.product_name.clone(),
        ),
        ("return_url".to_string(), request.return_url.clone()),
    ];
    if let Some(email) = &request.customer_email {
        form.push(("customer_email".to_string(), email.clone()));
    }
    form.extend(request.metadata.iter().map(|(k, v)| (format!("metadata[{k}]"), v.clone())));
    form.extend(
        request
            .payment_intent_metadata
            .iter()
            .map(|(k, v)| (format!("payment_intent_data[metadata][{k}]"), v.clone())),
    );
    form
}

#[async_trait]
impl PaymentService for StripeAdapter {
    #[instrument(skip(self, request), fields(amount = request.amount))]
    async fn create_payment_intent(&self, request: NewPaymentIntent) -> PortResult<PaymentIntent> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        form.extend(
            request
                .metadata
                .iter()
                .map(|(k, v)| (format!("metadata[{k}]"), v.clone())),
        );

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(Self::transport)?;

        let intent = Self::intent_from(response).await?;
        debug!(payment_intent_id = %intent.id, "Created payment intent");
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> PortResult<PaymentIntent> {
        let response = self
            .client
            .get(format!(
                "{}/payment_intents/{}",
                self.base_url,
                urlencoding::encode(payment_intent_id)
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::intent_from(response).await
    }

    async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> PortResult<()> {
        let form: Vec<(String, String)> = metadata
            .into_iter()
            .map(|(k, v)| (format!("metadata[{k}]"), v))
            .collect();
        let response = self
            .client
            .post(format!(
                "{}/payment_intents/{}",
                self.base_url,
                urlencoding::encode(payment_intent_id)
            ))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .map_err(Self::transport)?;
        Self::expect_success(response).await?;
        debug!(payment_intent_id, "Updated payment intent metadata");
        Ok(())
    }

    #[instrument(skip(self, request), fields(unit_amount = request.unit_amount))]
    async fn create_checkout_session(&self, request: NewCheckoutSession) -> PortResult<CheckoutSession> {
        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&checkout_form(&request))
            .send()
            .await
            .map_err(Self::transport)?;

        let session: StripeCheckoutSession = Self::expect_success(response)
            .await?
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Malformed Stripe response: {e}")))?;
        debug!(session_id = %session.id, livemode = session.livemode, "Created checkout session");
        Ok(CheckoutSession {
            id: session.id,
            client_secret: session.client_secret,
            payment_intent: session.payment_intent,
            livemode: session.livemode,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> PortResult<()> {
        let response = self
            .client
            .delete(format!(
                "{}/subscriptions/{}",
                self.base_url,
                urlencoding::encode(subscription_id)
            ))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::expect_success(response).await?;
        debug!(subscription_id, "Cancelled Stripe subscription");
        Ok(())
    }
}

//=========================================================================================
// Webhooks
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    #[error("Missing Stripe-Signature header")]
    MissingSignature,
    #[error("Malformed Stripe-Signature header")]
    MalformedHeader,
    #[error("Timestamp outside the tolerance zone")]
    Stale,
    #[error("No signatures found matching the expected signature for payload")]
    Mismatch,
    #[error("Invalid webhook payload: {0}")]
    Payload(String),
}

/// A verified webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub livemode: bool,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    pub fn object_str(&self, key: &str) -> Option<&str> {
        self.data.object.get(key).and_then(Value::as_str)
    }

    pub fn object_i64(&self, key: &str) -> Option<i64> {
        self.data.object.get(key).and_then(Value::as_i64)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.data
            .object
            .get("metadata")
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
    }
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against
/// the raw request body, then parses the event.
pub fn construct_event(
    payload: &str,
    header: Option<&str>,
    secret: &str,
    now: i64,
) -> Result<WebhookEvent, WebhookError> {
    verify_signature(payload, header.ok_or(WebhookError::MissingSignature)?, secret, now)?;
    serde_json::from_str(payload).map_err(|e| WebhookError::Payload(e.to_string()))
}

pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> Result<(), WebhookError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(WebhookError::MalformedHeader);
    }
    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(WebhookError::Stale);
    }

    let expected = sign(payload, timestamp, secret)?;
    if signatures.iter().any(|sig| constant_time_compare(&expected, sig)) {
        debug!("Stripe webhook signature verified");
        Ok(())
    } else {
        Err(WebhookError::Mismatch)
    }
}

/// The hex `v1` signature Stripe computes for `payload` sent at `timestamp`.
pub fn sign(payload: &str, timestamp: i64, secret: &str) -> Result<String, WebhookError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::MalformedHeader)?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
