//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores user-scoped authorizations to external music providers.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle states of a connection.
///
/// The value set is part of the external contract and must not grow
/// unlisted members.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "connected")]
    Connected,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "revoked")]
    Revoked,
    #[sea_orm(string_value = "error")]
    Error,
}

/// Connection entity representing a user's authorization against a provider
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning user
    pub user_id: Uuid,

    /// Slug of the provider this connection belongs to
    pub provider_slug: String,

    /// Provider-side account identifier
    pub external_id: String,

    /// Display name reported by the provider profile (optional)
    pub display_name: Option<String>,

    /// Connection status
    pub status: ConnectionStatus,

    /// Encrypted access token ciphertext
    pub access_token_ciphertext: Option<Vec<u8>>,

    /// Encrypted refresh token ciphertext
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry
    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// Granted OAuth scopes, stored as JSON array
    #[sea_orm(column_type = "JsonBinary")]
    pub scopes: Option<JsonValue>,

    /// Back-to-back failed refreshes, reset on any success
    pub consecutive_errors: i32,

    /// Total refresh retries since the last successful reauthorization
    pub retry_count: i32,

    /// Computed exponential backoff delay in seconds
    pub backoff_delay_seconds: i64,

    /// Timestamp of the last successful sync
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    /// Running ratio of successful syncs to attempts
    pub success_rate: f64,

    /// Running mean of per-item processing latency in milliseconds
    pub avg_response_ms: f64,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
