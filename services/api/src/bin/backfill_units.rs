//! services/api/src/bin/backfill_units.rs
//!
//! One-off maintenance job: fills `UnitID`, `Author` and
//! `LastModified` on content units that predate those fields.

use api_lib::{adapters, config::Config, error::ApiError};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    let config = Config::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db = adapters::database_service(&config).await;
    if db.is_mock_mode() {
        warn!("Running the backfill against the in-memory store; nothing will persist");
    }

    let report = db.backfill_units().await?;
    info!(
        scanned = report.scanned,
        updated = report.updated,
        "Unit backfill complete"
    );
    Ok(())
}
