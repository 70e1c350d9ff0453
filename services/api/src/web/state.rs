//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use crate::error::ApiError;
use curriculum_portal_core::ports::{PaymentService, TokenVerifier};
use curriculum_portal_core::DatabaseService;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseService>,
    pub config: Arc<Config>,
    pub token_verifier: Arc<dyn TokenVerifier>,
    /// Absent when no Stripe key is configured.
    pub payments: Option<Arc<dyn PaymentService>>,
}

impl AppState {
    pub fn payments(&self) -> Result<&dyn PaymentService, ApiError> {
        self.payments.as_deref().ok_or(ApiError::PaymentUnavailable)
    }
}
