//! Database migrations for the tunesync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_07_01_100000_create_auth_sessions;
mod m2026_07_01_100100_create_connections;
mod m2026_07_01_100200_create_sync_jobs;
mod m2026_07_01_100300_create_security_events;
mod m2026_07_01_100400_create_security_alerts;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_07_01_100000_create_auth_sessions::Migration),
            Box::new(m2026_07_01_100100_create_connections::Migration),
            Box::new(m2026_07_01_100200_create_sync_jobs::Migration),
            Box::new(m2026_07_01_100300_create_security_events::Migration),
            Box::new(m2026_07_01_100400_create_security_alerts::Migration),
        ]
    }
}
