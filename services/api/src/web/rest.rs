//! services/api/src/web/rest.rs
//!
//! Contains the service-level REST handlers (root, info, fallback) and the
//! master definition for the OpenAPI specification.

use crate::error::{ApiError, ErrorBody, ErrorEnvelope};
use crate::web::state::AppState;
use crate::web::{lessons, modules, payment, subscription, units, users};
use axum::{
    extract::State,
    http::{Method, Uri},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use std::sync::Arc;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        root_handler,
        info_handler,
        units::list_units_handler,
        units::get_unit_handler,
        units::create_unit_handler,
        units::update_unit_handler,
        units::delete_unit_handler,
        lessons::list_lessons_handler,
        lessons::get_lesson_handler,
        lessons::lesson_sections_handler,
        lessons::create_lesson_handler,
        lessons::update_lesson_handler,
        lessons::delete_lesson_handler,
        modules::list_modules_handler,
        modules::get_module_handler,
        modules::create_module_handler,
        modules::edit_module_handler,
        modules::delete_module_handler,
        users::me_handler,
        users::register_handler,
        users::list_users_handler,
        users::update_role_handler,
        users::public_profile_handler,
        subscription::subscription_test_handler,
        subscription::status_handler,
        subscription::initiate_upgrade_handler,
        subscription::complete_upgrade_handler,
        subscription::enterprise_contact_handler,
        subscription::admin_logs_handler,
        subscription::cancel_handler,
        subscription::reactivate_handler,
        subscription::process_payment_handler,
        payment::payment_test_handler,
        payment::create_payment_intent_handler,
        payment::confirm_payment_handler,
        payment::create_module_checkout_session_handler,
        payment::create_embedded_checkout_session_handler,
        payment::webhook_handler,
        payment::history_handler,
    ),
    components(
        schemas(
            ErrorEnvelope,
            ErrorBody,
            MessageResponse,
            lessons::LessonCreatedResponse,
            modules::ModuleRequest,
            users::RegisteredResponse,
            users::UpdateRoleRequest,
            users::UpdateRoleResponse,
            users::PublicProfile,
            subscription::UpgradeRequest,
            subscription::UpgradeCompletedResponse,
            subscription::EnterpriseContactRequest,
            subscription::CancelRequest,
            subscription::ProcessPaymentRequest,
            payment::CreatePaymentIntentRequest,
            payment::CreatePaymentIntentResponse,
            payment::ConfirmPaymentRequest,
            payment::ModuleCheckoutRequest,
            payment::ModuleCheckoutResponse,
            payment::EmbeddedCheckoutRequest,
            payment::EmbeddedCheckoutResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Curriculum Portal API", description = "Content units, lesson plans, modules, user profiles and subscriptions.")
    )
)]
pub struct ApiDoc;

/// Registers the `bearer_auth` scheme referenced by protected paths.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("Firebase ID token")
                        .build(),
                ),
            );
        }
    }
}

//=========================================================================================
// Shared Response Payloads
//=========================================================================================

/// A bare confirmation message.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

//=========================================================================================
// Service Handlers
//=========================================================================================

#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Greeting", content_type = "text/plain", body = String))
)]
pub async fn root_handler() -> &'static str {
    "Welcome to the Curriculum Portal API"
}

/// Which store the service runs against and under which schema qualifier.
#[utoipa::path(
    get,
    path = "/api/info",
    responses((status = 200, description = "Database service diagnostics"))
)]
pub async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.db.info())
}

/// Answers every request that matched no route.
pub async fn fallback_handler(method: Method, uri: Uri) -> ApiError {
    ApiError::RouteNotFound {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
}
