//! services/api/src/web/payment.rs
//!
//! Stripe checkout endpoints and the Stripe webhook receiver.
//!
//! Plan upgrades go through a payment intent (`create-payment-intent` then
//! `confirm-payment`) or an embedded Checkout session. Module purchases always
//! use an embedded Checkout session whose payment log entry is keyed by the
//! session id, so the later webhook events update that one entry in place.

use axum::{
    extract::State,
    http::{header::ORIGIN, HeaderMap},
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{SecondsFormat, Utc};
use curriculum_portal_core::database::CheckoutUpdate;
use curriculum_portal_core::ports::{NewCheckoutSession, NewPaymentIntent, VerifiedIdentity};
use curriculum_portal_core::subscription::{parse_target_plan, upgrade_patch, PaymentReference};
use curriculum_portal_core::{PaymentAction, PaymentLog, SubscriptionPlan};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::adapters::stripe::{construct_event, WebhookEvent};
use crate::error::{ApiError, ErrorEnvelope};
use crate::web::extract::ApiJson;
use crate::web::state::AppState;
use crate::web::subscription::load_profile;

/// Monthly premium price in cents.
pub const PREMIUM_MONTHLY_AMOUNT: i64 = 999;
/// Yearly premium price in cents.
pub const PREMIUM_YEARLY_AMOUNT: i64 = 10000;
pub const CURRENCY: &str = "usd";
const HISTORY_LIMIT: usize = 20;
const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
const MODULE_PURCHASE: &str = "module";
/// Stripe substitutes the session id for this placeholder in return URLs.
const SESSION_ID_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentRequest {
    pub plan_type: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentIntentResponse {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCheckoutRequest {
    pub module_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModuleCheckoutResponse {
    pub client_secret: Option<String>,
    pub session_id: String,
    pub livemode: bool,
    pub stripe_publishable_key: String,
    pub payment_log_id: String,
    pub payment_logs_collection: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedCheckoutRequest {
    pub plan_type: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedCheckoutResponse {
    pub client_secret: Option<String>,
    pub session_id: String,
}

#[utoipa::path(
    get,
    path = "/api/payment/test",
    responses((status = 200, description = "Payment routes are reachable"))
)]
pub async fn payment_test_handler() -> impl IntoResponse {
    Json(json!({
        "message": "Payment routes are working!",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "endpoints": [
            "POST /create-payment-intent (requires auth)",
            "POST /confirm-payment (requires auth)",
            "POST /create-module-checkout-session (requires auth)",
            "POST /create-embedded-checkout-session (requires auth)",
            "POST /webhook",
            "GET /history (requires auth)",
            "GET /test",
        ],
    }))
}

/// Create a Stripe payment intent for the monthly premium plan.
#[utoipa::path(
    post,
    path = "/api/payment/create-payment-intent",
    request_body = CreatePaymentIntentRequest,
    responses(
        (status = 200, description = "Intent created", body = CreatePaymentIntentResponse),
        (status = 400, description = "Invalid plan type", body = ErrorEnvelope),
        (status = 503, description = "Payments are not configured", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_payment_intent_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<CreatePaymentIntentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.plan_type.as_deref() != Some(SubscriptionPlan::Premium.as_str()) {
        return Err(ApiError::Validation("Invalid plan type".to_string()));
    }
    let payments = state.payments()?;
    let (_, profile) = load_profile(&state, &identity.uid).await?;
    let current = profile.plan();

    let mut metadata = BTreeMap::new();
    metadata.insert("userId".to_string(), identity.uid.clone());
    metadata.insert("planType".to_string(), SubscriptionPlan::Premium.to_string());
    metadata.insert("upgradeFrom".to_string(), current.to_string());
    if let Some(email) = &profile.email {
        metadata.insert("userEmail".to_string(), email.clone());
    }

    let request = NewPaymentIntent {
        amount: PREMIUM_MONTHLY_AMOUNT,
        currency: CURRENCY.to_string(),
        metadata,
    };
    let intent = match payments.create_payment_intent(request).await {
        Ok(intent) => intent,
        Err(e) => {
            error!(error = %e, uid = %identity.uid, "Failed to create payment intent");
            let mut entry = PaymentLog::new(Some(identity.uid.clone()), PaymentAction::PaymentIntentError, "error");
            entry.error = Some(e.to_string());
            state.db.record_payment_log(entry).await;
            return Err(ApiError::Payment(e));
        }
    };

    let mut entry = PaymentLog::new(
        Some(identity.uid.clone()),
        PaymentAction::PaymentIntentCreated,
        "payment_intent_created",
    )
    .plans(current, SubscriptionPlan::Premium)
    .email(profile.email);
    entry.payment_intent_id = Some(intent.id.clone());
    entry.amount = Some(PREMIUM_MONTHLY_AMOUNT);
    entry.currency = Some(CURRENCY.to_string());
    state.db.record_payment_log(entry).await;
    info!(uid = %identity.uid, payment_intent_id = %intent.id, "Payment intent created");

    Ok(Json(CreatePaymentIntentResponse {
        client_secret: intent.client_secret,
        payment_intent_id: intent.id,
    }))
}

/// Confirm a succeeded payment intent and activate the plan it paid for.
#[utoipa::path(
    post,
    path = "/api/payment/confirm-payment",
    request_body = ConfirmPaymentRequest,
    responses(
        (status = 200, description = "Subscription activated"),
        (status = 400, description = "Missing id or payment not completed", body = ErrorEnvelope),
        (status = 403, description = "Intent belongs to another user", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn confirm_payment_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<ConfirmPaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payment_intent_id = req
        .payment_intent_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("Payment intent ID required".to_string()))?;
    let payments = state.payments()?;

    let intent = match payments.retrieve_payment_intent(&payment_intent_id).await {
        Ok(intent) => intent,
        Err(e) => {
            error!(error = %e, uid = %identity.uid, "Failed to retrieve payment intent");
            let mut entry = PaymentLog::new(
                Some(identity.uid.clone()),
                PaymentAction::PaymentConfirmationError,
                "error",
            );
            entry.payment_intent_id = Some(payment_intent_id);
            entry.error = Some(e.to_string());
            state.db.record_payment_log(entry).await;
            return Err(ApiError::Payment(e));
        }
    };

    if !intent.is_succeeded() {
        debug!(payment_intent_id = %intent.id, status = %intent.status, "Payment not completed");
        return Err(ApiError::Validation("Payment not completed".to_string()));
    }
    if intent.metadata_value("userId") != Some(identity.uid.as_str()) {
        warn!(uid = %identity.uid, payment_intent_id = %intent.id, "Payment intent belongs to another user");
        return Err(ApiError::Forbidden("Payment verification failed".to_string()));
    }

    let plan = parse_target_plan(intent.metadata_value("planType"), "Invalid plan type")?;
    let (lookup, profile) = load_profile(&state, &identity.uid).await?;

    let mut patch = upgrade_patch(
        &profile,
        plan,
        Utc::now(),
        Some(PaymentReference::StripeIntent(intent.id.clone())),
    );
    patch.insert(
        "stripeCustomerId".to_string(),
        intent.customer.clone().map(Value::from).unwrap_or(Value::Null),
    );
    state.db.update_user_document(&lookup, patch).await?;

    let from = intent
        .metadata_value("upgradeFrom")
        .and_then(|p| p.parse::<SubscriptionPlan>().ok())
        .unwrap_or_else(|| profile.plan());
    let mut entry = PaymentLog::new(Some(identity.uid.clone()), PaymentAction::PaymentConfirmed, "completed")
        .plans(from, plan)
        .email(profile.email);
    entry.payment_intent_id = Some(intent.id.clone());
    entry.amount = Some(intent.amount);
    entry.currency = Some(intent.currency.clone());
    state.db.record_payment_log(entry).await;
    info!(uid = %identity.uid, plan = %plan, payment_intent_id = %intent.id, "Payment confirmed");

    Ok(Json(json!({
        "message": "Payment confirmed and subscription activated",
        "subscriptionType": plan,
        "subscriptionStatus": "active",
    })))
}

/// Start an embedded Checkout session for buying a priced module.
#[utoipa::path(
    post,
    path = "/api/payment/create-module-checkout-session",
    request_body = ModuleCheckoutRequest,
    responses(
        (status = 200, description = "Session created", body = ModuleCheckoutResponse),
        (status = 400, description = "Missing module id or the module is not for sale", body = ErrorEnvelope),
        (status = 404, description = "Module not found", body = ErrorEnvelope),
        (status = 500, description = "App domain or publishable key misconfigured", body = ErrorEnvelope),
        (status = 503, description = "Payments are not configured", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_module_checkout_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<ModuleCheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payments = state.payments()?;
    let module_id = req
        .module_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("moduleId is required".to_string()))?;
    let app_base_url = state.config.app_base_url(&app_domain(&state, &headers)?);

    let module = state
        .db
        .get_module(&module_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Module not found".to_string()))?;
    let price = module
        .doc
        .price()
        .ok_or_else(|| ApiError::Validation("This module does not have a valid paid price".to_string()))?;
    let unit_amount = (price * 100.0).round() as i64;
    let title = module.doc.display_title().unwrap_or("Module Purchase").to_string();

    let mut metadata = BTreeMap::new();
    metadata.insert("purchaseType".to_string(), MODULE_PURCHASE.to_string());
    metadata.insert("moduleId".to_string(), module_id.clone());
    metadata.insert("userId".to_string(), identity.uid.clone());

    let request = NewCheckoutSession {
        product_name: title.clone(),
        unit_amount,
        currency: CURRENCY.to_string(),
        customer_email: None,
        metadata: metadata.clone(),
        payment_intent_metadata: metadata.clone(),
        return_url: format!(
            "{app_base_url}/module/{}?checkout=success&session_id={SESSION_ID_PLACEHOLDER}",
            urlencoding::encode(&module_id)
        ),
    };
    let session = payments.create_checkout_session(request).await.map_err(|e| {
        error!(error = %e, uid = %identity.uid, module_id = %module_id, "Failed to create module checkout session");
        ApiError::Payment(e)
    })?;

    // Lets payment_intent.succeeded find the session's log entry.
    if let Some(payment_intent_id) = &session.payment_intent {
        metadata.insert("checkoutSessionId".to_string(), session.id.clone());
        if let Err(e) = payments.update_payment_intent_metadata(payment_intent_id, metadata).await {
            warn!(error = %e, payment_intent_id = %payment_intent_id, "Failed to link payment intent to checkout session");
        }
    }

    let publishable_key = publishable_key_for(&state, session.livemode)?;

    let mut entry = PaymentLog::new(
        Some(identity.uid.clone()),
        PaymentAction::ModuleCheckoutSessionCreated,
        "created",
    )
    .email(identity.email.clone());
    entry.checkout_session_id = Some(session.id.clone());
    entry.payment_intent_id = session.payment_intent.clone();
    entry.purchase_type = Some(MODULE_PURCHASE.to_string());
    entry.module_id = Some(module_id.clone());
    entry.module_title = Some(title);
    entry.amount = Some(unit_amount);
    entry.currency = Some(CURRENCY.to_string());
    entry.last_event_type = Some("module_checkout_session_created".to_string());
    state.db.put_payment_log(&session.id, &entry).await?;
    info!(uid = %identity.uid, module_id = %module_id, session_id = %session.id, "Module checkout session created");

    Ok(Json(ModuleCheckoutResponse {
        client_secret: session.client_secret,
        payment_log_id: session.id.clone(),
        session_id: session.id,
        livemode: session.livemode,
        stripe_publishable_key: publishable_key.to_string(),
        payment_logs_collection: state.db.collections().payment_logs(),
    }))
}

/// Start an embedded Checkout session for a premium plan.
#[utoipa::path(
    post,
    path = "/api/payment/create-embedded-checkout-session",
    request_body = EmbeddedCheckoutRequest,
    responses(
        (status = 200, description = "Session created", body = EmbeddedCheckoutResponse),
        (status = 400, description = "Invalid plan type", body = ErrorEnvelope),
        (status = 404, description = "User not found", body = ErrorEnvelope),
        (status = 503, description = "Payments are not configured", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_embedded_checkout_session_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<EmbeddedCheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let payments = state.payments()?;
    let (plan, amount, product_name) = match req.plan_type.as_deref() {
        Some("premium") => (SubscriptionPlan::Premium, PREMIUM_MONTHLY_AMOUNT, "Premium (Monthly)"),
        Some("premiumYearly") => (SubscriptionPlan::PremiumYearly, PREMIUM_YEARLY_AMOUNT, "Premium (Yearly)"),
        _ => return Err(ApiError::Validation("Invalid plan type".to_string())),
    };
    let (_, profile) = load_profile(&state, &identity.uid).await?;
    let domain = app_domain(&state, &headers)?;

    let mut metadata = BTreeMap::new();
    metadata.insert("userId".to_string(), identity.uid.clone());
    metadata.insert("planType".to_string(), plan.to_string());
    if let Some(email) = &profile.email {
        metadata.insert("userEmail".to_string(), email.clone());
    }

    let request = NewCheckoutSession {
        product_name: product_name.to_string(),
        unit_amount: amount,
        currency: CURRENCY.to_string(),
        customer_email: profile.email.clone(),
        metadata,
        payment_intent_metadata: BTreeMap::new(),
        return_url: format!("{}/return?session_id={SESSION_ID_PLACEHOLDER}", domain.trim_end_matches('/')),
    };
    let session = payments.create_checkout_session(request).await.map_err(|e| {
        error!(error = %e, uid = %identity.uid, "Failed to create embedded checkout session");
        ApiError::Payment(e)
    })?;
    info!(uid = %identity.uid, plan = %plan, session_id = %session.id, "Embedded checkout session created");

    Ok(Json(EmbeddedCheckoutResponse {
        client_secret: session.client_secret,
        session_id: session.id,
    }))
}

/// The web app origin for Checkout return URLs: `DOMAIN`, else the caller's `Origin`.
fn app_domain(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let domain = state
        .config
        .app_domain
        .clone()
        .or_else(|| headers.get(ORIGIN).and_then(|v| v.to_str().ok()).map(str::to_string))
        .unwrap_or_default();
    let lower = domain.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(domain)
    } else {
        Err(ApiError::Misconfigured(
            "DOMAIN must start with http:// or https://".to_string(),
        ))
    }
}

/// The publishable key for a session's mode. A key from the other mode would
/// make the browser reject the session, so that is reported as misconfiguration.
fn publishable_key_for(state: &AppState, livemode: bool) -> Result<&str, ApiError> {
    let key = state
        .config
        .stripe_publishable_keys
        .for_mode(livemode)
        .ok_or_else(|| ApiError::Misconfigured("missing Stripe publishable key".to_string()))?;
    let expected = if livemode { "pk_live_" } else { "pk_test_" };
    if key.starts_with(expected) {
        Ok(key)
    } else {
        Err(ApiError::Misconfigured(format!(
            "expected a {expected} publishable key for a {} checkout session",
            if livemode { "live" } else { "test" }
        )))
    }
}

/// Stripe webhook receiver. The raw body is needed to check the signature.
#[utoipa::path(
    post,
    path = "/api/payment/webhook",
    request_body(content_type = "application/json", description = "Stripe event, signed via the Stripe-Signature header"),
    params(("Stripe-Signature" = String, Header, description = "t=<unix>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Event accepted"),
        (status = 400, description = "Signature verification failed", body = ErrorEnvelope)
    )
)]
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .ok_or(ApiError::PaymentUnavailable)?;
    let signature = headers.get(STRIPE_SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let event = construct_event(&body, signature, secret, Utc::now().timestamp()).map_err(|e| {
        warn!(error = %e, "Webhook signature verification failed");
        ApiError::Validation(format!("Webhook Error: {e}"))
    })?;

    let entry = webhook_log_entry(&event);
    let update = checkout_update(&event, Utc::now());
    if entry.is_none() && update.is_none() {
        debug!(kind = %event.kind, "Unhandled Stripe event type");
    }

    if let Some(entry) = entry {
        info!(kind = %event.kind, payment_intent_id = ?entry.payment_intent_id, "Stripe webhook received");
        state.db.record_payment_log(entry).await;
    }
    if let Some(update) = update {
        let session_id = update.session_id.clone();
        if let Err(e) = state.db.merge_checkout_log(update).await {
            error!(error = %e, kind = %event.kind, session_id = %session_id, "Failed to update checkout payment log");
        }
    }

    Ok(Json(json!({ "received": true })))
}

/// How a webhook event changes the payment log entry of a Checkout session.
/// Payment intents only count when they were linked to a session.
fn checkout_update(event: &WebhookEvent, at: chrono::DateTime<Utc>) -> Option<CheckoutUpdate> {
    let metadata = |key: &str| event.metadata_str(key).map(str::to_string);
    let (session_id, status, payment_intent_id, amount) = match event.kind.as_str() {
        "checkout.session.completed" => (
            event.object_str("id")?.to_string(),
            "completed",
            event.object_str("payment_intent").map(str::to_string),
            event.object_i64("amount_total"),
        ),
        "payment_intent.succeeded" => (
            metadata("checkoutSessionId")?,
            "succeeded",
            event.object_str("id").map(str::to_string),
            event.object_i64("amount"),
        ),
        _ => return None,
    };
    Some(CheckoutUpdate {
        session_id,
        livemode: event.livemode,
        event_type: event.kind.clone(),
        status: status.to_string(),
        at,
        payment_intent_id,
        purchase_type: metadata("purchaseType"),
        user_id: metadata("userId"),
        module_id: metadata("moduleId"),
        amount,
        currency: event.object_str("currency").map(str::to_string),
    })
}

/// The payment log entry recorded for a webhook event, if the event is one we track.
fn webhook_log_entry(event: &WebhookEvent) -> Option<PaymentLog> {
    let user_id = event.metadata_str("userId").map(str::to_string);
    let mut entry = match event.kind.as_str() {
        "payment_intent.succeeded" => {
            let mut entry = PaymentLog::new(user_id, PaymentAction::WebhookPaymentSucceeded, "webhook_received");
            entry.amount = event.object_i64("amount");
            entry.currency = event.object_str("currency").map(str::to_string);
            entry.checkout_session_id = event.metadata_str("checkoutSessionId").map(str::to_string);
            entry.purchase_type = event.metadata_str("purchaseType").map(str::to_string);
            entry.module_id = event.metadata_str("moduleId").map(str::to_string);
            entry
        }
        "payment_intent.payment_failed" => {
            let mut entry = PaymentLog::new(user_id, PaymentAction::WebhookPaymentFailed, "payment_failed");
            let message = event
                .data
                .object
                .get("last_payment_error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("Payment failed");
            entry.error = Some(message.to_string());
            entry
        }
        _ => return None,
    };
    entry.payment_intent_id = event.object_str("id").map(str::to_string);
    Some(entry)
}

/// The caller's most recent payment log entries.
#[utoipa::path(
    get,
    path = "/api/payment/history",
    responses((status = 200, description = "Up to 20 entries, newest first")),
    security(("bearer_auth" = []))
)]
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.payment_history(&identity.uid, HISTORY_LIMIT).await?))
}
