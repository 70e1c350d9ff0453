//! crates/curriculum_portal_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the application's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the document store, the identity provider and the payment
//! processor actually used at runtime.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Document Store
//=========================================================================================

/// The top-level fields of a stored document.
pub type DocumentData = Map<String, Value>;

/// A document read back from a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: DocumentData,
}

impl StoredDocument {
    /// Decodes the document fields into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> PortResult<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            PortError::Unexpected(format!("Malformed document {}: {}", self.id, e))
        })
    }
}

/// A schemaless collection/document store.
///
/// Collection names arrive already qualified. Implementations must make
/// `increment` atomic with respect to concurrent callers.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> PortResult<Option<StoredDocument>>;

    async fn list(&self, collection: &str) -> PortResult<Vec<StoredDocument>>;

    /// Documents whose top-level `field` equals `value`.
    async fn find_by(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> PortResult<Vec<StoredDocument>>;

    /// Inserts a document under a freshly generated id.
    async fn add(&self, collection: &str, data: DocumentData) -> PortResult<StoredDocument>;

    /// Creates or overwrites the document with the given id.
    async fn set(&self, collection: &str, id: &str, data: DocumentData) -> PortResult<()>;

    /// Merges `patch` into the top-level fields of an existing document.
    /// Fails with `NotFound` when the document does not exist.
    async fn update(&self, collection: &str, id: &str, patch: DocumentData) -> PortResult<()>;

    async fn delete(&self, collection: &str, id: &str) -> PortResult<()>;

    /// Atomically adds one to the numeric `field` of a counter document and
    /// returns the new value. A missing document or field counts from zero.
    async fn increment(&self, collection: &str, id: &str, field: &str) -> PortResult<i64>;

    /// True for the in-memory development store.
    fn is_mock(&self) -> bool;
}

//=========================================================================================
// Identity
//=========================================================================================

/// The caller identity carried by a verified ID token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub uid: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies a bearer ID token and returns the identity it asserts.
    async fn verify(&self, token: &str) -> PortResult<VerifiedIdentity>;
}

//=========================================================================================
// Payments
//=========================================================================================

/// Parameters for a new payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaymentIntent {
    /// Amount in the smallest currency unit (cents).
    pub amount: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
}

/// A payment intent as reported by the payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub customer: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub last_payment_error: Option<String>,
}

impl PaymentIntent {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Parameters for a one-item embedded Checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckoutSession {
    pub product_name: String,
    /// Price of the single line item in cents.
    pub unit_amount: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Copied onto the payment intent the session creates.
    pub payment_intent_metadata: BTreeMap<String, String>,
    /// May contain the `{CHECKOUT_SESSION_ID}` placeholder.
    pub return_url: String,
}

/// A Checkout session as reported by the payment processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub client_secret: Option<String>,
    pub payment_intent: Option<String>,
    pub livemode: bool,
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn create_payment_intent(&self, request: NewPaymentIntent) -> PortResult<PaymentIntent>;

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> PortResult<PaymentIntent>;

    /// Replaces the given metadata keys on an existing payment intent.
    async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> PortResult<()>;

    async fn create_checkout_session(&self, request: NewCheckoutSession) -> PortResult<CheckoutSession>;

    /// Cancels a recurring subscription immediately.
    async fn cancel_subscription(&self, subscription_id: &str) -> PortResult<()>;
}

//=========================================================================================
// Post-Sign-In Continuation
//=========================================================================================

/// Tab-scoped key/value storage that survives a redirect to the identity provider.
pub trait PostAuthStore: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
}

/// Where an existing account lives and which role it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAccount {
    pub role: crate::domain::Role,
    pub collection: String,
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Looks up a signed-in user in the teachers and students collections.
    async fn resolve_account(&self, uid: &str) -> PortResult<Option<ResolvedAccount>>;
}

#[async_trait]
pub trait RegistrationClient: Send + Sync {
    /// Calls the register endpoint on behalf of the user holding `id_token`.
    /// Returns the HTTP status code of the response.
    async fn register(&self, id_token: &str, body: &Value) -> PortResult<u16>;
}
