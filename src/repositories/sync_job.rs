//! # SyncJob Repository
//!
//! Repository operations for the sync_jobs table, encapsulating SeaORM
//! operations with user-scoped access patterns.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::sync_job::{self, ActiveModel, Column, Entity, JobStatus, Model, SyncType};

/// Repository for sync job database operations
pub struct SyncJobRepository {
    db: Arc<DatabaseConnection>,
}

impl SyncJobRepository {
    /// Create a new SyncJobRepository with the given database connection
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Insert a new job row in the `initializing` state.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        provider_slug: &str,
        sync_type: SyncType,
        priority: i16,
        phases: JsonValue,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now().fixed_offset();
        let id = Uuid::new_v4();

        let job = ActiveModel {
            id: Set(id),
            connection_id: Set(connection_id),
            user_id: Set(user_id),
            provider_slug: Set(provider_slug.to_string()),
            sync_type: Set(sync_type),
            priority: Set(priority),
            status: Set(JobStatus::Initializing),
            phases: Set(phases),
            current_phase: Set(None),
            overall_progress: Set(0.0),
            errors: Set(JsonValue::Array(Vec::new())),
            warnings: Set(JsonValue::Array(Vec::new())),
            control_history: Set(JsonValue::Array(Vec::new())),
            started_at: Set(None),
            estimated_completion_at: Set(None),
            finished_at: Set(None),
            paused_ms: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        };

        job.insert(&*self.db).await?;

        Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| sea_orm::DbErr::RecordNotFound("sync job not persisted".into()))
    }

    /// Find a sync job by ID, ensuring it belongs to the specified user
    pub async fn find_for_user(
        &self,
        user_id: Uuid,
        job_id: Uuid,
    ) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(job_id)
            .filter(Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
    }

    /// Fetch a job by ID without user scoping (worker-side accesses)
    pub async fn get_by_id(&self, job_id: Uuid) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(job_id).one(&*self.db).await
    }

    /// The live (non-terminal) job for a connection, if any.
    pub async fn find_active_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Status.is_in([
                JobStatus::Initializing,
                JobStatus::InProgress,
                JobStatus::Paused,
            ]))
            .order_by_desc(Column::CreatedAt)
            .one(&*self.db)
            .await
    }

    /// List sync jobs for a user with optional filtering
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        connection_id: Option<Uuid>,
        status: Option<JobStatus>,
        limit: Option<u64>,
    ) -> Result<Vec<Model>, sea_orm::DbErr> {
        let mut query = Entity::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_desc(Column::CreatedAt);

        if let Some(connection_id) = connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id));
        }
        if let Some(status) = status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(limit) = limit {
            query = query.limit(limit);
        }

        query.all(&*self.db).await
    }

    /// Persist phase progress for a running job.
    pub async fn save_progress(
        &self,
        job: Model,
        phases: JsonValue,
        current_phase: Option<String>,
        overall_progress: f64,
        estimated_completion_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<Model, sea_orm::DbErr> {
        let mut active: ActiveModel = job.into();
        active.phases = Set(phases);
        active.current_phase = Set(current_phase);
        active.overall_progress = Set(overall_progress);
        active.estimated_completion_at = Set(estimated_completion_at.map(Into::into));
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    /// Transition a job's status, stamping started/finished timestamps as
    /// appropriate.
    pub async fn transition(
        &self,
        job: Model,
        status: JobStatus,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now().fixed_offset();
        let stamp_started = job.started_at.is_none() && status == JobStatus::InProgress;

        let mut active: ActiveModel = job.into();
        if stamp_started {
            active.started_at = Set(Some(now));
        }
        if status.is_terminal() {
            active.finished_at = Set(Some(now));
        }
        active.status = Set(status);
        active.updated_at = Set(now);
        active.update(&*self.db).await
    }

    /// Append entries to the item-level error and warning logs.
    pub async fn append_issues(
        &self,
        job: Model,
        errors: Vec<JsonValue>,
        warnings: Vec<JsonValue>,
    ) -> Result<Model, sea_orm::DbErr> {
        let mut all_errors = as_array(&job.errors);
        all_errors.extend(errors);
        let mut all_warnings = as_array(&job.warnings);
        all_warnings.extend(warnings);

        let mut active: ActiveModel = job.into();
        active.errors = Set(JsonValue::Array(all_errors));
        active.warnings = Set(JsonValue::Array(all_warnings));
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    /// Append one control action to the job's control history.
    pub async fn append_control(
        &self,
        job: Model,
        entry: JsonValue,
    ) -> Result<Model, sea_orm::DbErr> {
        let mut history = as_array(&job.control_history);
        history.push(entry);

        let mut active: ActiveModel = job.into();
        active.control_history = Set(JsonValue::Array(history));
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }

    /// Add to the accumulated paused time.
    pub async fn add_paused_ms(&self, job: Model, delta_ms: i64) -> Result<Model, sea_orm::DbErr> {
        let total = job.paused_ms + delta_ms;
        let mut active: ActiveModel = job.into();
        active.paused_ms = Set(total);
        active.updated_at = Set(Utc::now().fixed_offset());
        active.update(&*self.db).await
    }
}

fn as_array(value: &JsonValue) -> Vec<JsonValue> {
    value.as_array().cloned().unwrap_or_default()
}
