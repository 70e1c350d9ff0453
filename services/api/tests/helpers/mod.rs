//! services/api/tests/helpers/mod.rs
//!
//! Shared fixtures: a router over the seeded in-memory store, the mock
//! tokens, and a scriptable payment processor.

#![allow(dead_code)]

pub mod axum_test;

use api_lib::adapters::{self, MockTokenVerifier};
use api_lib::config::Config;
use api_lib::web::{build_router, state::AppState};
use async_trait::async_trait;
use axum::Router;
use curriculum_portal_core::ports::{
    CheckoutSession, NewCheckoutSession, NewPaymentIntent, PaymentIntent, PaymentService, PortError, PortResult,
    VerifiedIdentity,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const ADMIN_TOKEN: &str = "valid-admin-token";
pub const TEACHER_TOKEN: &str = "valid-user-token";
pub const PREMIUM_TOKEN: &str = "valid-premium-token";
/// Verifies, but no profile exists for it until it registers.
pub const NEW_USER_TOKEN: &str = "new-user-token";

pub const ADMIN_UID: &str = "admin-user-123";
pub const TEACHER_UID: &str = "test-user-123";
pub const PREMIUM_UID: &str = "premium-user-123";
pub const NEW_USER_UID: &str = "new-user-456";

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const APP_DOMAIN: &str = "https://portal.example.com";
pub const PUBLISHABLE_KEY: &str = "pk_test_portal";

/// Payment processor double: intents live in memory and can be marked paid.
#[derive(Default)]
pub struct FakePayments {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    cancelled: Mutex<Vec<String>>,
    sessions: Mutex<Vec<NewCheckoutSession>>,
    intent_metadata: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl FakePayments {
    pub fn succeed(&self, id: &str) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(id) {
            intent.status = "succeeded".to_string();
            intent.customer = Some("cus_test".to_string());
        }
    }

    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        self.intents.lock().unwrap().get(id).cloned()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Every Checkout session requested so far, oldest first.
    pub fn sessions(&self) -> Vec<NewCheckoutSession> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn intent_metadata(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.intent_metadata.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl PaymentService for FakePayments {
    async fn create_payment_intent(&self, request: NewPaymentIntent) -> PortResult<PaymentIntent> {
        let mut intents = self.intents.lock().unwrap();
        let id = format!("pi_test_{}", intents.len() + 1);
        let intent = PaymentIntent {
            id: id.clone(),
            client_secret: Some(format!("{id}_secret")),
            status: "requires_payment_method".to_string(),
            amount: request.amount,
            currency: request.currency,
            customer: None,
            metadata: request.metadata,
            last_payment_error: None,
        };
        intents.insert(id, intent.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> PortResult<PaymentIntent> {
        self.intent(payment_intent_id)
            .ok_or_else(|| PortError::NotFound(format!("No such payment_intent: {payment_intent_id}")))
    }

    async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> PortResult<()> {
        self.intent_metadata
            .lock()
            .unwrap()
            .entry(payment_intent_id.to_string())
            .or_default()
            .extend(metadata);
        Ok(())
    }

    async fn create_checkout_session(&self, request: NewCheckoutSession) -> PortResult<CheckoutSession> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.push(request);
        let n = sessions.len();
        Ok(CheckoutSession {
            id: format!("cs_test_{n}"),
            client_secret: Some(format!("cs_test_{n}_secret")),
            payment_intent: Some(format!("pi_cs_test_{n}")),
            livemode: false,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> PortResult<()> {
        self.cancelled.lock().unwrap().push(subscription_id.to_string());
        Ok(())
    }
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub payments: Arc<FakePayments>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(true, &[]).await
    }

    /// An app with no payment processor configured.
    pub async fn without_payments() -> Self {
        Self::build(false, &[]).await
    }

    /// An app whose environment differs from the default test setup.
    /// An empty value removes the variable.
    pub async fn with_env(overrides: &[(&'static str, &'static str)]) -> Self {
        Self::build(true, overrides).await
    }

    async fn build(with_payments: bool, overrides: &[(&'static str, &'static str)]) -> Self {
        let vars: HashMap<&str, &str> = [
            ("APP_ENV", "test"),
            ("STRIPE_WEBHOOK_SECRET", WEBHOOK_SECRET),
            ("DOMAIN", APP_DOMAIN),
            ("STRIPE_PUBLISHABLE_KEY_TEST", PUBLISHABLE_KEY),
        ]
        .into_iter()
        .chain(overrides.iter().copied())
        .collect();
        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        let db = Arc::new(adapters::database_service(&config).await);
        assert!(db.is_mock_mode());

        let verifier = MockTokenVerifier::new().with_token(
            NEW_USER_TOKEN,
            VerifiedIdentity {
                uid: NEW_USER_UID.to_string(),
                email: Some("new.teacher@example.com".to_string()),
                name: Some("New Teacher".to_string()),
            },
        );

        let payments = Arc::new(FakePayments::default());
        let state = Arc::new(AppState {
            db,
            config: Arc::new(config),
            token_verifier: Arc::new(verifier),
            payments: with_payments.then(|| payments.clone() as Arc<dyn PaymentService>),
        });
        Self { state, payments }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }
}
