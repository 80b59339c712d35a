//! # Sync API Handlers
//!
//! Handlers for starting sync jobs, inspecting their phased progress, and
//! controlling a running job (pause, resume, cancel).

use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::error::ApiError;
use crate::models::sync_job::{self, JobStatus, SyncType};
use crate::server::AppState;
use crate::sync::{ControlAction, JobPhases, PhaseState, StartedSync};

/// Request body for starting a sync job
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct StartSyncRequest {
    /// Kind of synchronization to run
    pub sync_type: SyncType,
    /// Priority; a strictly higher value supersedes a running job
    #[serde(default = "default_priority")]
    pub priority: i16,
}

fn default_priority() -> i16 {
    1
}

/// A freshly accepted sync job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StartSyncResponse {
    /// Identifier of the created job
    #[schema(value_type = String)]
    pub job_id: Uuid,
    /// Status the job was accepted in
    pub status: JobStatus,
    /// Completion estimate, absent until progress is measurable
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl From<StartedSync> for StartSyncResponse {
    fn from(started: StartedSync) -> Self {
        Self {
            job_id: started.job_id,
            status: started.status,
            estimated_completion: started.estimated_completion,
        }
    }
}

/// Progress of one pipeline phase
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PhaseProgress {
    /// Phase name, e.g. `data_fetch`
    pub name: String,
    pub completed: bool,
    /// Item estimate the progress weighting uses
    pub estimated_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
}

impl From<&PhaseState> for PhaseProgress {
    fn from(phase: &PhaseState) -> Self {
        Self {
            name: phase.name.as_str().to_string(),
            completed: phase.completed,
            estimated_items: phase.estimated_items,
            processed_items: phase.processed_items,
            failed_items: phase.failed_items,
            skipped_items: phase.skipped_items,
        }
    }
}

/// Full status of a sync job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SyncJobResponse {
    #[schema(value_type = String)]
    pub job_id: Uuid,
    #[schema(value_type = String)]
    pub connection_id: Uuid,
    pub provider: String,
    pub sync_type: SyncType,
    pub status: JobStatus,
    /// Weighted overall progress fraction in [0, 1]
    pub overall_progress: f64,
    /// Name of the phase currently executing
    pub current_phase: Option<String>,
    /// Per-phase progress in pipeline order
    pub phases: Vec<PhaseProgress>,
    /// Item-level error log
    pub errors: JsonValue,
    /// Non-fatal warnings surfaced during the run
    pub warnings: JsonValue,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl From<sync_job::Model> for SyncJobResponse {
    fn from(model: sync_job::Model) -> Self {
        let phases = JobPhases::from_json(&model.phases)
            .map(|job_phases| job_phases.phases.iter().map(PhaseProgress::from).collect())
            .unwrap_or_default();
        Self {
            job_id: model.id,
            connection_id: model.connection_id,
            provider: model.provider_slug,
            sync_type: model.sync_type,
            status: model.status,
            overall_progress: model.overall_progress,
            current_phase: model.current_phase,
            phases,
            errors: model.errors,
            warnings: model.warnings,
            started_at: model.started_at.map(|dt| dt.with_timezone(&Utc)),
            finished_at: model.finished_at.map(|dt| dt.with_timezone(&Utc)),
            estimated_completion: model
                .estimated_completion_at
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Request body for controlling a running job
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct ControlSyncRequest {
    /// Action to apply: `pause`, `resume` or `cancel`
    pub action: ControlAction,
}

/// Outcome of a control action
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ControlSyncResponse {
    pub success: bool,
    /// Status the job settled in after the action
    pub new_status: JobStatus,
}

/// Starts a sync job for a connection
#[utoipa::path(
    post,
    path = "/connections/{connection_id}/sync",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("connection_id" = String, Path, description = "Connection identifier")
    ),
    request_body = StartSyncRequest,
    responses(
        (status = 200, description = "Sync job accepted", body = StartSyncResponse),
        (status = 401, description = "Connection needs reauthorization", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 409, description = "A job with equal or higher priority is already running", body = ApiError),
        (status = 503, description = "Provider unavailable or worker capacity reached", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn start_sync(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(connection_id): Path<Uuid>,
    Json(request): Json<StartSyncRequest>,
) -> Result<Json<StartSyncResponse>, ApiError> {
    let started = state
        .orchestrator
        .start(user.0, connection_id, request.sync_type, request.priority)
        .await?;
    Ok(Json(started.into()))
}

/// Returns the current status and phase progress of a sync job
#[utoipa::path(
    get,
    path = "/sync/jobs/{job_id}",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("job_id" = String, Path, description = "Sync job identifier")
    ),
    responses(
        (status = 200, description = "Sync job status", body = SyncJobResponse, example = json!({
            "job_id": "3f2d1f9e-5a7b-4c31-90aa-1d7a29c85b10",
            "connection_id": "550e8400-e29b-41d4-a716-446655440000",
            "provider": "spotify",
            "sync_type": "full",
            "status": "in_progress",
            "overall_progress": 0.42,
            "current_phase": "data_fetch",
            "phases": [
                {"name": "initialization", "completed": true, "estimated_items": 1, "processed_items": 1, "failed_items": 0, "skipped_items": 0}
            ],
            "errors": [],
            "warnings": [],
            "started_at": "2025-01-01T10:00:00Z",
            "finished_at": null,
            "estimated_completion": "2025-01-01T10:05:00Z"
        })),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn sync_job_status(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(job_id): Path<Uuid>,
) -> Result<Json<SyncJobResponse>, ApiError> {
    let job = state.orchestrator.status(user.0, job_id).await?;
    Ok(Json(job.into()))
}

/// Pauses, resumes or cancels a sync job
#[utoipa::path(
    post,
    path = "/sync/jobs/{job_id}/control",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("job_id" = String, Path, description = "Sync job identifier")
    ),
    request_body = ControlSyncRequest,
    responses(
        (status = 200, description = "Control action applied", body = ControlSyncResponse),
        (status = 400, description = "Action not valid for the job's current status", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 500, description = "Worker failed to drain within the stall timeout", body = ApiError)
    ),
    tag = "sync"
)]
pub async fn control_sync_job(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ControlSyncRequest>,
) -> Result<Json<ControlSyncResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .control(user.0, job_id, request.action)
        .await?;
    Ok(Json(ControlSyncResponse {
        success: outcome.success,
        new_status: outcome.new_status,
    }))
}
