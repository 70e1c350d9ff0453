//! services/api/src/web/subscription.rs
//!
//! Subscription lifecycle endpoints: status, upgrades, cancellation,
//! reactivation, enterprise contact requests and the demo card payment.
//! Every state change is written to the payment log.

use axum::{
    extract::State,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::Utc;
use curriculum_portal_core::database::UserLookup;
use curriculum_portal_core::ports::VerifiedIdentity;
use curriculum_portal_core::subscription::{
    cancellation_patch, ensure_cancellable, ensure_reactivatable, parse_target_plan, reactivation_patch,
    stripe_subscription_to_cancel, upgrade_patch, upgrade_session_id, PaymentReference, SubscriptionSummary,
};
use curriculum_portal_core::{
    EnterpriseContact, PaymentAction, PaymentLog, SubscriptionPlan, UserProfile,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;

use crate::error::{ApiError, ErrorEnvelope};
use crate::web::extract::ApiJson;
use crate::web::rest::MessageResponse;
use crate::web::state::AppState;

const ADMIN_LOG_LIMIT: usize = 100;

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub target_plan: Option<String>,
    pub payment_intent_id: Option<String>,
    pub upgrade_session_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCompletedResponse {
    pub message: String,
    pub new_plan: String,
    pub subscription_status: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseContactRequest {
    pub message: Option<String>,
    pub contact_preference: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequest {
    pub reason: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPaymentRequest {
    pub plan_type: Option<String>,
    /// Amount charged, in currency units (e.g. `9.99`).
    pub amount: Option<f64>,
    #[schema(value_type = Option<Object>)]
    pub card_info: Option<Value>,
    pub billing_cycle: Option<String>,
}

//=========================================================================================
// Helpers
//=========================================================================================

/// The caller's profile and where it lives, or 404.
pub(crate) async fn load_profile(state: &AppState, uid: &str) -> Result<(UserLookup, UserProfile), ApiError> {
    let lookup = state.db.get_user_document(uid).await?;
    let profile = lookup
        .profile
        .clone()
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    Ok((lookup, profile))
}

//=========================================================================================
// Handlers
//=========================================================================================

#[utoipa::path(
    get,
    path = "/api/subscription/test",
    responses((status = 200, description = "Subscription routes are reachable", body = MessageResponse))
)]
pub async fn subscription_test_handler() -> impl IntoResponse {
    Json(MessageResponse::new("Subscription routes are working!"))
}

/// The caller's plan, status, end date and whether they can upgrade.
#[utoipa::path(
    get,
    path = "/api/subscription/status",
    responses(
        (status = 200, description = "Current subscription"),
        (status = 404, description = "User not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, profile) = load_profile(&state, &identity.uid).await?;
    Ok(Json(SubscriptionSummary::of(&profile)))
}

/// Start an upgrade. Enterprise upgrades go through a contact request;
/// premium upgrades return a session id for the payment step.
#[utoipa::path(
    post,
    path = "/api/subscription/initiate-upgrade",
    request_body = UpgradeRequest,
    responses(
        (status = 200, description = "Upgrade initiated"),
        (status = 400, description = "Invalid target plan", body = ErrorEnvelope),
        (status = 404, description = "User not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn initiate_upgrade_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<UpgradeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = parse_target_plan(req.target_plan.as_deref(), "Invalid target plan")?;
    let (_, profile) = load_profile(&state, &identity.uid).await?;
    let current = profile.plan();

    let entry = PaymentLog::new(Some(identity.uid.clone()), PaymentAction::UpgradeInitiated, "initiated")
        .plans(current, target)
        .email(profile.email.clone());
    state.db.append_payment_log(&entry).await?;
    info!(uid = %identity.uid, from = %current, to = %target, "Upgrade initiated");

    if target == SubscriptionPlan::Enterprise {
        return Ok(Json(json!({
            "message": "Enterprise upgrade request initiated",
            "requiresContact": true,
        })));
    }

    Ok(Json(json!({
        "message": "Premium upgrade initiated",
        "requiresPayment": true,
        "currentPlan": current,
        "targetPlan": target,
        "upgradeSessionId": upgrade_session_id(&identity.uid, Utc::now()),
    })))
}

/// Apply the target plan: role, status, and for premium plans the term end.
#[utoipa::path(
    post,
    path = "/api/subscription/complete-upgrade",
    request_body = UpgradeRequest,
    responses(
        (status = 200, description = "Upgrade applied", body = UpgradeCompletedResponse),
        (status = 400, description = "Invalid target plan", body = ErrorEnvelope),
        (status = 404, description = "User not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn complete_upgrade_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<UpgradeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = parse_target_plan(req.target_plan.as_deref(), "Invalid target plan")?;
    let (lookup, profile) = load_profile(&state, &identity.uid).await?;
    let current = profile.plan();

    let payment = req.payment_intent_id.clone().map(PaymentReference::StripeIntent);
    let patch = upgrade_patch(&profile, target, Utc::now(), payment);
    state.db.update_user_document(&lookup, patch).await?;

    let mut entry = PaymentLog::new(Some(identity.uid.clone()), PaymentAction::UpgradeCompleted, "completed")
        .plans(current, target)
        .email(profile.email.clone());
    entry.payment_intent_id = req.payment_intent_id;
    entry.upgrade_session_id = req.upgrade_session_id;
    state.db.record_payment_log(entry).await;
    info!(uid = %identity.uid, from = %current, to = %target, "Upgrade completed");

    Ok(Json(UpgradeCompletedResponse {
        message: "Upgrade completed successfully".to_string(),
        new_plan: target.to_string(),
        subscription_status: "active".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/subscription/enterprise-contact",
    request_body = EnterpriseContactRequest,
    responses(
        (status = 200, description = "Request stored", body = MessageResponse),
        (status = 404, description = "User not found", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn enterprise_contact_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<EnterpriseContactRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (_, profile) = load_profile(&state, &identity.uid).await?;

    let contact = EnterpriseContact {
        user_id: identity.uid.clone(),
        user_email: profile.email.clone(),
        full_name: profile.full_name.clone(),
        institution: profile.institution.clone(),
        message: req.message.unwrap_or_default(),
        contact_preference: req.contact_preference.unwrap_or_else(|| "email".to_string()),
        timestamp: Utc::now(),
        status: "pending".to_string(),
    };
    state.db.add_enterprise_contact(&contact).await?;

    let entry = PaymentLog::new(
        Some(identity.uid.clone()),
        PaymentAction::EnterpriseContactRequested,
        "contact_requested",
    )
    .plans(profile.plan(), SubscriptionPlan::Enterprise)
    .email(profile.email);
    state.db.record_payment_log(entry).await;

    Ok(Json(MessageResponse::new(
        "Enterprise contact request submitted successfully",
    )))
}

/// The latest payment log entries across all users.
#[utoipa::path(
    get,
    path = "/api/subscription/admin/logs",
    responses(
        (status = 200, description = "Up to 100 entries, newest first"),
        (status = 403, description = "Caller is not an admin", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn admin_logs_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.db.recent_payment_logs(ADMIN_LOG_LIMIT).await?))
}

/// Downgrade to the basic plan immediately, cancelling any recurring Stripe
/// subscription first.
#[utoipa::path(
    post,
    path = "/api/subscription/cancel",
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Subscription cancelled"),
        (status = 400, description = "Already on the basic plan", body = ErrorEnvelope),
        (status = 500, description = "Stripe cancellation failed", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<CancelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (lookup, profile) = load_profile(&state, &identity.uid).await?;
    let current = ensure_cancellable(&profile)?;

    if let Some(subscription_id) = stripe_subscription_to_cancel(&profile) {
        let payments = state.payments()?;
        payments.cancel_subscription(subscription_id).await.map_err(|e| {
            error!(error = %e, uid = %identity.uid, subscription_id, "Failed to cancel Stripe subscription");
            ApiError::Internal("Failed to cancel Stripe subscription. Please try again later.".to_string())
        })?;
    }

    let reason = req.reason.filter(|r| !r.is_empty());
    let feedback = req.feedback.filter(|f| !f.is_empty());
    let patch = cancellation_patch(Utc::now(), reason.as_deref(), feedback.as_deref());
    state.db.update_user_document(&lookup, patch).await?;

    let mut entry = PaymentLog::new(Some(identity.uid.clone()), PaymentAction::SubscriptionCancelled, "cancelled")
        .plans(current, SubscriptionPlan::Basic)
        .email(profile.email);
    entry.reason = reason;
    entry.feedback = feedback;
    state.db.record_payment_log(entry).await;
    info!(uid = %identity.uid, from = %current, "Subscription cancelled");

    Ok(Json(json!({
        "message": "Subscription cancelled successfully",
        "newPlan": SubscriptionPlan::Basic,
        "subscriptionStatus": "cancelled",
    })))
}

#[utoipa::path(
    post,
    path = "/api/subscription/reactivate",
    responses(
        (status = 200, description = "Subscription active again"),
        (status = 400, description = "Subscription is not cancelled", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn reactivate_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    let (lookup, profile) = load_profile(&state, &identity.uid).await?;
    ensure_reactivatable(&profile)?;

    state
        .db
        .update_user_document(&lookup, reactivation_patch(Utc::now()))
        .await?;

    let entry = PaymentLog::new(
        Some(identity.uid.clone()),
        PaymentAction::SubscriptionReactivated,
        "reactivated",
    )
    .email(profile.email);
    state.db.record_payment_log(entry).await;

    Ok(Json(json!({
        "message": "Subscription reactivated successfully",
        "subscriptionStatus": "active",
    })))
}

/// Demo checkout: accepts any card details and applies the plan at once.
#[utoipa::path(
    post,
    path = "/api/subscription/process-payment",
    request_body = ProcessPaymentRequest,
    responses(
        (status = 200, description = "Payment accepted and plan applied"),
        (status = 400, description = "Invalid plan or missing payment information", body = ErrorEnvelope)
    ),
    security(("bearer_auth" = []))
)]
pub async fn process_payment_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<VerifiedIdentity>,
    ApiJson(req): ApiJson<ProcessPaymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let plan = parse_target_plan(req.plan_type.as_deref(), "Invalid plan type")?;
    let (Some(amount), Some(_card)) = (
        req.amount.filter(|a| *a > 0.0),
        req.card_info.filter(|c| !c.is_null()),
    ) else {
        return Err(ApiError::Validation(
            "Missing required payment information".to_string(),
        ));
    };

    let (lookup, profile) = load_profile(&state, &identity.uid).await?;
    let current = profile.plan();
    let now = Utc::now();

    let reference = PaymentReference::Demo(format!("demo_payment_{}", now.timestamp_millis()));
    let patch = upgrade_patch(&profile, plan, now, Some(reference));
    state.db.update_user_document(&lookup, patch).await?;

    let mut entry = PaymentLog::new(Some(identity.uid.clone()), PaymentAction::PaymentProcessed, "completed")
        .plans(current, plan)
        .email(profile.email);
    entry.amount = Some(to_cents(amount));
    entry.billing_cycle = Some(req.billing_cycle.clone().unwrap_or_else(|| "month".to_string()));
    entry.payment_method = Some("demo_card".to_string());
    state.db.record_payment_log(entry).await;
    info!(uid = %identity.uid, plan = %plan, "Demo payment processed");

    Ok(Json(json!({
        "message": "Payment processed successfully",
        "subscriptionType": plan,
        "subscriptionStatus": "active",
        "amount": amount,
        "billingCycle": req.billing_cycle,
    })))
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}
