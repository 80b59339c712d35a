//! # Audit API Handlers
//!
//! Read surface over the security audit trail: unresolved alerts for the
//! dashboard, plus operator acknowledgement.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::audit::risk;
use crate::auth::{OperatorAuth, UserHeader};
use crate::error::ApiError;
use crate::models::security_alert;
use crate::server::AppState;

/// Query parameters for alert listing
#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListAlertsQuery {
    /// Minimum risk level (1 = info .. 4 = critical); defaults to the
    /// alerting threshold
    pub min_level: Option<i32>,
}

/// An unacknowledged security alert
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AlertInfo {
    #[schema(value_type = String)]
    pub id: Uuid,
    /// The security event that triggered the alert
    #[schema(value_type = String)]
    pub event_id: Uuid,
    /// Risk level on the 1..=4 scale
    pub risk_level: i32,
    /// Short operator-facing summary
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

impl From<security_alert::Model> for AlertInfo {
    fn from(model: security_alert::Model) -> Self {
        Self {
            id: model.id,
            event_id: model.event_id,
            risk_level: model.risk_level,
            summary: model.summary,
            created_at: model.created_at.with_timezone(&Utc),
        }
    }
}

/// Response wrapper for alert listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AlertsResponse {
    /// Unacknowledged alerts, newest first
    pub alerts: Vec<AlertInfo>,
}

/// Outcome of acknowledging an alert
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AcknowledgeResponse {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Lists unacknowledged security alerts at or above a risk level
#[utoipa::path(
    get,
    path = "/audit/alerts",
    security(("bearer_auth" = [])),
    params(UserHeader, ListAlertsQuery),
    responses(
        (status = 200, description = "Open alerts", body = AlertsResponse, example = json!({
            "alerts": [
                {
                    "id": "8a3e1c2d-0f4b-4a57-9c1e-2b6f8d0a9e11",
                    "event_id": "550e8400-e29b-41d4-a716-446655440000",
                    "risk_level": 3,
                    "summary": "sync_job_failed",
                    "created_at": "2025-01-01T10:00:00Z"
                }
            ]
        })),
        (status = 400, description = "Invalid risk level", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "audit"
)]
pub async fn list_alerts(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let min_level = query.min_level.unwrap_or(risk::HIGH);
    if !(risk::INFO..=risk::CRITICAL).contains(&min_level) {
        return Err(crate::error::validation_error(
            "Invalid risk level",
            serde_json::json!({ "min_level": "Must be between 1 and 4" }),
        ));
    }
    let alerts = state
        .audit
        .list_unresolved(min_level)
        .await?
        .into_iter()
        .map(AlertInfo::from)
        .collect();
    Ok(Json(AlertsResponse { alerts }))
}

/// Acknowledges a security alert
#[utoipa::path(
    post,
    path = "/audit/alerts/{alert_id}/acknowledge",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("alert_id" = String, Path, description = "Alert identifier")
    ),
    responses(
        (status = 200, description = "Alert acknowledged", body = AcknowledgeResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Alert not found", body = ApiError)
    ),
    tag = "audit"
)]
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Path(alert_id): Path<Uuid>,
) -> Result<Json<AcknowledgeResponse>, ApiError> {
    let alert = state.audit.acknowledge(alert_id).await?.ok_or_else(|| {
        ApiError::new(
            axum::http::StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Alert not found",
        )
    })?;
    Ok(Json(AcknowledgeResponse {
        id: alert.id,
        acknowledged: alert.acknowledged,
        acknowledged_at: alert.acknowledged_at.map(|dt| dt.with_timezone(&Utc)),
    }))
}
