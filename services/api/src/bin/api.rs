//! services/api/src/bin/api.rs

use api_lib::{
    adapters,
    config::Config,
    error::ApiError,
    web::{build_router, state::AppState},
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(environment = %config.environment, "Configuration loaded. Starting server...");
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    // --- 2. Connect to the Document Store ---
    let db = Arc::new(adapters::database_service(&config).await);

    // --- 3. Initialize Provider Adapters ---
    let token_verifier = adapters::token_verifier(&config, &db)?;
    let payments = adapters::payment_service(&config);

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        db,
        config: config.clone(),
        token_verifier,
        payments,
    });

    // --- 5. Create the Web Router ---
    let app = build_router(app_state);

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
