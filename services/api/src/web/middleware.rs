//! services/api/src/web/middleware.rs
//!
//! Authentication and role-gate middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use curriculum_portal_core::ports::VerifiedIdentity;
use curriculum_portal_core::{authorize, RoleRequirement};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::web::state::AppState;

/// Middleware that verifies the `Authorization: Bearer` ID token.
///
/// If valid, inserts the caller's `VerifiedIdentity` into request extensions
/// for handlers and gates to use. Otherwise responds 401.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // 1. Extract the bearer token
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthenticated("Authorization token required".to_string()))?;

    // 2. Verify it with the identity provider
    let identity = state.token_verifier.verify(token).await.map_err(|e| {
        warn!(error = %e, "Rejected bearer token");
        ApiError::Unauthenticated("Invalid or expired token".to_string())
    })?;
    debug!(uid = %identity.uid, "Authenticated request");

    // 3. Insert the identity into request extensions
    req.extensions_mut().insert(identity);

    // 4. Continue to the handler
    Ok(next.run(req).await)
}

/// Loads the caller's profile and checks it against `requirement`. On success
/// the resolved `CallerProfile` is attached to the request.
async fn gate(state: &AppState, mut req: Request, next: Next, requirement: RoleRequirement) -> Result<Response, ApiError> {
    let uid = req.extensions().get::<VerifiedIdentity>().map(|id| id.uid.clone());
    let caller = authorize(&state.db, uid.as_deref(), requirement).await?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

pub async fn require_admin(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Result<Response, ApiError> {
    gate(&state, req, next, RoleRequirement::Admin).await
}

pub async fn require_teacher(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Result<Response, ApiError> {
    gate(&state, req, next, RoleRequirement::Teacher).await
}

pub async fn require_premium_teacher(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    gate(&state, req, next, RoleRequirement::PremiumTeacher).await
}

pub async fn require_valid_user(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    gate(&state, req, next, RoleRequirement::ValidUser).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{self, MockTokenVerifier};
    use crate::config::Config;
    use axum::{
        body::{to_bytes, Body},
        http::StatusCode,
        middleware::from_fn_with_state,
        routing::get,
        Extension, Router,
    };
    use curriculum_portal_core::CallerProfile;
    use tower::ServiceExt;

    async fn state() -> Arc<AppState> {
        let config = Config::from_lookup(|key| (key == "APP_ENV").then(|| "test".to_string())).unwrap();
        let db = Arc::new(adapters::database_service(&config).await);
        Arc::new(AppState {
            db,
            config: Arc::new(config),
            token_verifier: Arc::new(MockTokenVerifier::new()),
            payments: None,
        })
    }

    async fn role(Extension(caller): Extension<CallerProfile>) -> String {
        caller.role.to_string()
    }

    fn app(state: Arc<AppState>) -> Router {
        let premium = Router::new()
            .route("/premium", get(role))
            .route_layer(from_fn_with_state(state.clone(), require_premium_teacher))
            .route_layer(from_fn_with_state(state.clone(), require_auth));
        let any = Router::new()
            .route("/any", get(role))
            .route_layer(from_fn_with_state(state.clone(), require_valid_user))
            .route_layer(from_fn_with_state(state.clone(), require_auth));
        premium.merge(any).with_state(state)
    }

    async fn call(uri: &str, authorization: Option<&str>) -> (StatusCode, String) {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        let response = app(state().await)
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn premium_gate_admits_paid_tiers_only() {
        let (status, body) = call("/premium", Some("Bearer valid-premium-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "teacherPlus");

        let (status, body) = call("/premium", Some("Bearer valid-user-token")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("AUTHORIZATION_ERROR"));
    }

    #[tokio::test]
    async fn valid_user_gate_admits_any_existing_profile() {
        let (status, body) = call("/any", Some("Bearer valid-admin-token")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "admin");
    }

    #[tokio::test]
    async fn malformed_headers_are_unauthenticated() {
        for header in [None, Some("Bearer "), Some("Basic dXNlcjpwYXNz"), Some("Bearer bogus")] {
            let (status, body) = call("/any", header).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{header:?}");
            assert!(body.contains("AUTH_ERROR"));
        }
    }
}
