//! # TuneSync Main Entry Point
//!
//! Loads configuration, initializes telemetry and the database pool, runs
//! pending migrations and starts the API server.

use sea_orm_migration::MigratorTrait;
use tracing::info;
use tunesync::migration::Migrator;
use tunesync::{config::ConfigLoader, db::init_pool, server::run_server, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    info!(profile = %config.profile, "loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        info!(config = %redacted_json, "effective configuration");
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None).await?;

    run_server(config, db).await
}
