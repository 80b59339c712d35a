//! # Data Models
//!
//! This module contains all the data models used throughout the tunesync service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod auth_session;
pub mod connection;
pub mod security_alert;
pub mod security_event;
pub mod sync_job;

pub use auth_session::Entity as AuthSession;
pub use connection::Entity as Connection;
pub use security_alert::Entity as SecurityAlert;
pub use security_event::Entity as SecurityEvent;
pub use sync_job::Entity as SyncJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "tunesync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
