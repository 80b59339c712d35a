//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table:
//! one run of the phased synchronization pipeline for a single connection.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Kind of synchronization requested.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    #[sea_orm(string_value = "full")]
    Full,
    #[sea_orm(string_value = "incremental")]
    Incremental,
    #[sea_orm(string_value = "favorites")]
    Favorites,
    #[sea_orm(string_value = "playlists")]
    Playlists,
}

/// Lifecycle states of a sync job.
///
/// `Paused` is a reversible sub-state of being in progress; the rest of the
/// non-initial states are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[sea_orm(string_value = "initializing")]
    Initializing,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "paused")]
    Paused,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "superseded")]
    Superseded,
}

impl JobStatus {
    /// Whether the job can still make progress or be controlled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Superseded
        )
    }
}

/// SyncJob entity representing one run of the phased sync pipeline
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Connection this job synchronizes
    pub connection_id: Uuid,

    /// Owning user (denormalized for listing)
    pub user_id: Uuid,

    /// Slug of the provider this job is for
    pub provider_slug: String,

    /// Kind of sync requested
    pub sync_type: SyncType,

    /// Job priority (higher values supersede lower ones)
    pub priority: i16,

    /// Current status of the job
    pub status: JobStatus,

    /// Ordered per-phase progress records (see `sync::phases::PhaseState`)
    #[sea_orm(column_type = "JsonBinary")]
    pub phases: JsonValue,

    /// Name of the phase currently executing
    pub current_phase: Option<String>,

    /// Weighted overall progress fraction in [0, 1]
    pub overall_progress: f64,

    /// Item-level error log
    #[sea_orm(column_type = "JsonBinary")]
    pub errors: JsonValue,

    /// Non-fatal warnings surfaced during the run
    #[sea_orm(column_type = "JsonBinary")]
    pub warnings: JsonValue,

    /// Audit log of pause/resume/cancel/restart actions
    #[sea_orm(column_type = "JsonBinary")]
    pub control_history: JsonValue,

    /// Timestamp when the job started execution
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Estimated completion time, recomputed as phases advance
    pub estimated_completion_at: Option<DateTimeWithTimeZone>,

    /// Timestamp when the job reached a terminal state
    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Accumulated time spent paused, in milliseconds
    pub paused_ms: i64,

    /// Timestamp when the sync job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the sync job was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Initializing.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Superseded.is_terminal());
    }
}
