//! # Connections API Handlers
//!
//! Handlers for listing a user's provider connections and disconnecting
//! them, including best-effort token revocation at the provider.

use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::{OperatorAuth, UserExtension, UserHeader};
use crate::error::ApiError;
use crate::models::connection::{self, ConnectionStatus};
use crate::providers::HealthStatus;
use crate::server::AppState;

/// Connection information for API responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    /// Unique identifier for the connection
    #[schema(value_type = String)]
    pub id: Uuid,
    /// Provider slug (e.g. `spotify`, `apple_music`)
    pub provider: String,
    /// Current lifecycle status
    pub status: ConnectionStatus,
    /// Display name reported by the provider
    pub display_name: Option<String>,
    /// Scopes granted to the connection
    pub scopes: Vec<String>,
    /// When the last successful sync finished
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Provider health as seen by the periodic probe; absent when the
    /// provider is no longer configured
    pub health: Option<HealthStatus>,
    /// Exponentially weighted sync success rate in [0, 1]
    pub success_rate: f64,
    /// Exponentially weighted average per-item processing time
    pub avg_response_ms: f64,
}

impl ConnectionInfo {
    fn from_model(model: connection::Model, health: Option<HealthStatus>) -> Self {
        let scopes = model
            .scopes
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Self {
            id: model.id,
            provider: model.provider_slug,
            status: model.status,
            display_name: model.display_name,
            scopes,
            last_sync_at: model.last_sync_at.map(|dt| dt.with_timezone(&Utc)),
            health,
            success_rate: model.success_rate,
            avg_response_ms: model.avg_response_ms,
        }
    }
}

/// Response wrapper for connection listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionsResponse {
    /// The user's connections, all providers included
    pub connections: Vec<ConnectionInfo>,
}

/// Request body for disconnecting a connection
#[derive(Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct DisconnectRequest {
    /// Free-form reason recorded in the audit trail
    #[serde(default)]
    pub reason: Option<String>,
}

/// Outcome of a disconnect request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DisconnectResponse {
    /// When the tokens were discarded locally
    pub disconnected_at: DateTime<Utc>,
    /// Whether the provider accepted the token revocation call
    pub revoked_from_provider: bool,
}

/// Lists the authenticated user's provider connections
#[utoipa::path(
    get,
    path = "/connections",
    security(("bearer_auth" = [])),
    params(UserHeader),
    responses(
        (status = 200, description = "The user's connections", body = ConnectionsResponse, example = json!({
            "connections": [
                {
                    "id": "550e8400-e29b-41d4-a716-446655440000",
                    "provider": "spotify",
                    "status": "connected",
                    "display_name": "Alex",
                    "scopes": ["user-library-read"],
                    "last_sync_at": "2025-01-01T10:00:00Z",
                    "health": "healthy",
                    "success_rate": 0.98,
                    "avg_response_ms": 42.5
                }
            ]
        })),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
) -> Result<Json<ConnectionsResponse>, ApiError> {
    let models = state.store.repository().find_by_user(&user.0).await?;
    let connections = models
        .into_iter()
        .map(|model| {
            let health = state
                .registry
                .descriptor(&model.provider_slug)
                .ok()
                .map(|descriptor| descriptor.health);
            ConnectionInfo::from_model(model, health)
        })
        .collect();
    Ok(Json(ConnectionsResponse { connections }))
}

/// Disconnects a connection, revoking tokens at the provider when possible
#[utoipa::path(
    delete,
    path = "/connections/{connection_id}",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("connection_id" = String, Path, description = "Connection identifier")
    ),
    request_body = DisconnectRequest,
    responses(
        (status = 200, description = "Connection disconnected", body = DisconnectResponse),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn disconnect_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(connection_id): Path<Uuid>,
    Json(request): Json<DisconnectRequest>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let reason = request.reason.as_deref().unwrap_or("user requested");
    let outcome = state
        .store
        .disconnect(user.0, connection_id, reason)
        .await?;
    Ok(Json(DisconnectResponse {
        disconnected_at: outcome.disconnected_at,
        revoked_from_provider: outcome.revoked_from_provider,
    }))
}
