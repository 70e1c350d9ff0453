//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and the JSON
//! envelope every failed request is answered with.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{SecondsFormat, Utc};
use curriculum_portal_core::{AccessDenied, PortError};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};
use utoipa::ToSchema;

/// Whether error envelopes carry a `details` object. Turned off in production.
static EXPOSE_DETAILS: AtomicBool = AtomicBool::new(true);

pub fn set_expose_details(expose: bool) {
    EXPOSE_DETAILS.store(expose, Ordering::Relaxed);
}

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// A payment processor failure. Kept apart from `Port` so that it is not
    /// reported as a database problem.
    #[error("Payment Error: {0}")]
    Payment(PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Payment processing is not configured")]
    PaymentUnavailable,

    /// A deployment setting needed by this request is missing or inconsistent.
    #[error("Server misconfigured: {0}")]
    Misconfigured(String),

    #[error("Route {method} {path} not found")]
    RouteNotFound { method: String, path: String },

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl From<AccessDenied> for ApiError {
    fn from(denied: AccessDenied) -> Self {
        match denied {
            AccessDenied::ProfileNotFound => ApiError::NotFound(denied.to_string()),
            AccessDenied::Unauthenticated | AccessDenied::RoleNotAllowed { .. } => {
                ApiError::Forbidden(denied.to_string())
            }
            AccessDenied::Store(e) => ApiError::Port(e),
        }
    }
}

/// The body of every error response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub status_code: u16,
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}

impl ApiError {
    /// Status, machine-readable code and client-facing message.
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "AUTH_ERROR", msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "AUTHORIZATION_ERROR", msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::PaymentUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "PAYMENT_UNAVAILABLE",
                "Payment service is not configured".to_string(),
            ),
            ApiError::RouteNotFound { .. } => (StatusCode::NOT_FOUND, "ROUTE_NOT_FOUND", self.to_string()),
            ApiError::Misconfigured(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SERVER_MISCONFIGURED", self.to_string()),
            ApiError::Port(e) => match e {
                PortError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
                PortError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                PortError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
                PortError::PermissionDenied(_) => (
                    StatusCode::FORBIDDEN,
                    "DATABASE_PERMISSION_DENIED",
                    "Access denied to database resource".to_string(),
                ),
                PortError::Unavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "DATABASE_UNAVAILABLE",
                    "Database service is temporarily unavailable".to_string(),
                ),
                PortError::Unauthorized => (
                    StatusCode::UNAUTHORIZED,
                    "AUTH_ERROR",
                    "Invalid or expired token".to_string(),
                ),
                PortError::Unexpected(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "Database operation failed".to_string(),
                ),
            },
            ApiError::Payment(e) => match e {
                PortError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
                PortError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
                PortError::Unavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "PAYMENT_UNAVAILABLE",
                    "Payment service is temporarily unavailable".to_string(),
                ),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Payment processing failed".to_string(),
                ),
            },
            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database operation failed".to_string(),
            ),
            ApiError::Config(_) | ApiError::Io(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }

    /// Diagnostic detail for non-production responses. Request-level errors
    /// already say everything in their message.
    fn details(&self) -> Option<Value> {
        let kind = match self {
            ApiError::Port(_) => "PortError",
            ApiError::Payment(_) => "PaymentError",
            ApiError::Database(_) => "DatabaseError",
            ApiError::Config(_) => "ConfigError",
            ApiError::Io(_) => "IoError",
            ApiError::Internal(_) => "InternalError",
            _ => return None,
        };
        Some(json!({ "errorType": kind, "originalError": self.to_string() }))
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (status, code, message) = self.parts();
        ErrorEnvelope {
            success: false,
            status_code: status.as_u16(),
            error: ErrorBody {
                code: code.to_string(),
                message,
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                details: EXPOSE_DETAILS
                    .load(Ordering::Relaxed)
                    .then(|| self.details())
                    .flatten(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = self.envelope();
        let status = StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(code = %envelope.error.code, error = %self, "Request failed");
        } else {
            warn!(code = %envelope.error.code, status = status.as_u16(), "{}", envelope.error.message);
        }

        (status, Json(envelope)).into_response()
    }
}
