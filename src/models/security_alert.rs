//! SecurityAlert entity model
//!
//! Raised for events whose risk level crosses the configured threshold.
//! Requires explicit acknowledgement by an operator.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// SecurityAlert entity representing an unacknowledged high-risk finding
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "security_alerts")]
pub struct Model {
    /// Unique identifier for the alert (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// The security event that triggered this alert
    pub event_id: Uuid,

    /// Risk level copied from the triggering event
    pub risk_level: i32,

    /// Short operator-facing summary
    pub summary: String,

    /// Whether an operator has acknowledged the alert
    pub acknowledged: bool,

    /// When the alert was acknowledged
    pub acknowledged_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the alert was raised
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::security_event::Entity",
        from = "Column::EventId",
        to = "super::security_event::Column::Id"
    )]
    SecurityEvent,
}

impl Related<super::security_event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SecurityEvent.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
