pub mod extract;
pub mod lessons;
pub mod middleware;
pub mod modules;
pub mod payment;
pub mod rest;
pub mod state;
pub mod subscription;
pub mod units;
pub mod users;

pub use middleware::require_auth;
pub use rest::ApiDoc;
pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, ORIGIN},
        HeaderName, HeaderValue, Method,
    },
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::Config;
use crate::error::set_expose_details;
use middleware::{require_admin, require_teacher};

/// Builds the complete application: public, token-only, teacher and admin
/// routes, the Swagger UI, the fallback and the cross-cutting layers.
pub fn build_router(state: Arc<AppState>) -> Router {
    set_expose_details(!state.config.is_production());
    let config = state.config.clone();

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/", get(rest::root_handler))
        .route("/api/info", get(rest::info_handler))
        .route("/api/units", get(units::list_units_handler))
        .route("/api/unit/{id}", get(units::get_unit_handler))
        .route("/api/lessons", get(lessons::list_lessons_handler))
        .route("/api/lesson/{id}", get(lessons::get_lesson_handler))
        .route("/api/lesson/{id}/sections", get(lessons::lesson_sections_handler))
        .route("/api/modules", get(modules::list_modules_handler))
        .route("/api/module/{id}", get(modules::get_module_handler))
        .route("/api/user/{userId}", get(users::public_profile_handler))
        .route("/api/subscription/test", get(subscription::subscription_test_handler))
        .route("/api/payment/test", get(payment::payment_test_handler))
        .route("/api/payment/webhook", post(payment::webhook_handler));

    // Any verified token
    let token_routes = Router::new()
        .route("/api/user/me", get(users::me_handler))
        .route("/api/user/register", post(users::register_handler))
        .route("/api/subscription/status", get(subscription::status_handler))
        .route("/api/subscription/initiate-upgrade", post(subscription::initiate_upgrade_handler))
        .route("/api/subscription/complete-upgrade", post(subscription::complete_upgrade_handler))
        .route("/api/subscription/enterprise-contact", post(subscription::enterprise_contact_handler))
        .route("/api/subscription/cancel", post(subscription::cancel_handler))
        .route("/api/subscription/reactivate", post(subscription::reactivate_handler))
        .route("/api/subscription/process-payment", post(subscription::process_payment_handler))
        .route("/api/payment/create-payment-intent", post(payment::create_payment_intent_handler))
        .route("/api/payment/confirm-payment", post(payment::confirm_payment_handler))
        .route(
            "/api/payment/create-module-checkout-session",
            post(payment::create_module_checkout_session_handler),
        )
        .route(
            "/api/payment/create-embedded-checkout-session",
            post(payment::create_embedded_checkout_session_handler),
        )
        .route("/api/payment/history", get(payment::history_handler))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    // Teachers of any tier (route layers run last-added first: token, then role)
    let teacher_routes = Router::new()
        .route("/api/unit", post(units::create_unit_handler))
        .route("/api/update/{id}", post(units::update_unit_handler))
        .route("/api/unit/{id}", delete(units::delete_unit_handler))
        .route("/api/lesson", post(lessons::create_lesson_handler))
        .route(
            "/api/lesson/{id}",
            put(lessons::update_lesson_handler).delete(lessons::delete_lesson_handler),
        )
        .route("/api/module", post(modules::create_module_handler))
        .route("/api/module/{id}", post(modules::edit_module_handler))
        .route_layer(from_fn_with_state(state.clone(), require_teacher))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let admin_routes = Router::new()
        .route("/api/module/{id}", delete(modules::delete_module_handler))
        .route("/api/user/users", get(users::list_users_handler))
        .route("/api/user/updateRole", put(users::update_role_handler))
        .route("/api/subscription/admin/logs", get(subscription::admin_logs_handler))
        .route_layer(from_fn_with_state(state.clone(), require_admin))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let api_router = Router::new()
        .merge(public_routes)
        .merge(token_routes)
        .merge(teacher_routes)
        .merge(admin_routes)
        .with_state(state);

    Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .fallback(rest::fallback_handler)
        .layer(DefaultBodyLimit::max(config.max_request_size))
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http())
}

/// Allows the configured origins with credentials, or any origin when none
/// are configured.
fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            ACCEPT,
            ORIGIN,
            HeaderName::from_static("x-requested-with"),
        ])
}
