pub mod db;
pub mod firebase;
pub mod memory;
pub mod register_client;
pub mod stripe;

pub use db::DbAdapter;
pub use firebase::{FirebaseTokenVerifier, MockTokenVerifier};
pub use memory::MemoryDocumentStore;
pub use register_client::HttpRegistrationClient;
pub use stripe::StripeAdapter;

use crate::config::{Config, ConfigError};
use curriculum_portal_core::ports::{DocumentStore, PaymentService, TokenVerifier};
use curriculum_portal_core::{Collections, DatabaseService};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Builds the database shim over Postgres, or over the seeded in-memory store
/// when mock mode is selected or Postgres cannot be reached.
pub async fn database_service(config: &Config) -> DatabaseService {
    let collections = Collections::new(config.schema_qualifier.clone());
    let has_valid_config = config.database_url.is_some();

    let store: Arc<dyn DocumentStore> = match connect_postgres(config, &collections).await {
        Some(store) => store,
        None => mock_store(&collections).await,
    };

    info!(
        mock_mode = store.is_mock(),
        schema_qualifier = %collections.qualifier(),
        environment = %config.environment,
        "Database service initialized"
    );
    DatabaseService::new(store, collections).with_environment(config.environment.as_str(), has_valid_config)
}

async fn connect_postgres(config: &Config, collections: &Collections) -> Option<Arc<dyn DocumentStore>> {
    if config.uses_mock_database() {
        return None;
    }
    let url = config.database_url.as_deref()?;

    info!("Connecting to database...");
    let pool = match PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "Database connection failed, falling back to mock store");
            return None;
        }
    };

    let adapter = DbAdapter::new(pool);
    if let Err(e) = adapter.ensure_collections(&collections.all()).await {
        error!(error = %e, "Could not prepare collections, falling back to mock store");
        return None;
    }
    Some(Arc::new(adapter))
}

async fn mock_store(collections: &Collections) -> Arc<dyn DocumentStore> {
    let store = MemoryDocumentStore::new();
    if let Err(e) = store.seed_mock_users(&collections.users()).await {
        warn!(error = %e, "Failed to seed mock users");
    }
    Arc::new(store)
}

/// Mock stores pair with the fixed mock tokens; real stores need Firebase.
///
/// Production always verifies against Firebase: a store that fell back to mock
/// mode must not also open the door to the canned mock tokens.
pub fn token_verifier(config: &Config, db: &DatabaseService) -> Result<Arc<dyn TokenVerifier>, ConfigError> {
    if config.is_production() {
        let project_id = config
            .firebase_project_id
            .clone()
            .ok_or_else(|| ConfigError::MissingForEnvironment {
                environment: config.environment.to_string(),
                missing: "FIREBASE_PROJECT_ID".to_string(),
            })?;
        if db.is_mock_mode() {
            error!("Production is running on the mock document store; mock tokens stay disabled");
        }
        return Ok(Arc::new(FirebaseTokenVerifier::new(project_id)));
    }

    Ok(match (&config.firebase_project_id, db.is_mock_mode()) {
        (Some(project_id), false) => Arc::new(FirebaseTokenVerifier::new(project_id.clone())),
        (None, false) => {
            warn!("FIREBASE_PROJECT_ID is not set; accepting mock tokens only");
            Arc::new(MockTokenVerifier::new())
        }
        (_, true) => {
            warn!("Mock document store in use; accepting mock tokens");
            Arc::new(MockTokenVerifier::new())
        }
    })
}

pub fn payment_service(config: &Config) -> Option<Arc<dyn PaymentService>> {
    match &config.stripe_secret_key {
        Some(key) => Some(Arc::new(StripeAdapter::new(key.clone()))),
        None => {
            warn!("Stripe is not configured; payment endpoints will answer 503");
            None
        }
    }
}
