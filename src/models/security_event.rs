//! SecurityEvent entity model
//!
//! Append-only audit trail of risk-scored events. Rows are never mutated
//! after creation except for the `resolved` flag.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// SecurityEvent entity representing one audit record
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "security_events")]
pub struct Model {
    /// Unique identifier for the event (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// User the event concerns, when applicable
    pub user_id: Option<Uuid>,

    /// Event type, e.g. `oauth_session_completed`, `token_refresh_failed`
    pub event_type: String,

    /// Computed risk level, 1 (info) through 4 (critical)
    pub risk_level: i32,

    /// Free-text description
    pub description: String,

    /// Structured metadata
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,

    /// Whether the event has been looked at and resolved
    pub resolved: bool,

    /// Retention expiry; rows past this instant are eligible for purge
    pub retain_until: DateTimeWithTimeZone,

    /// Timestamp when the event was recorded
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::security_alert::Entity")]
    SecurityAlert,
}

impl Related<super::security_alert::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SecurityAlert.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
