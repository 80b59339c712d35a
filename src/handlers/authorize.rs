//! # Authorization Flow Handlers
//!
//! Handlers for the PKCE authorization lifecycle: initiating a session,
//! completing it through the OAuth callback, and cancelling it early.

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
use crate::oauth_session::{CompletedAuthorization, InitiatedAuthorization};
use crate::providers::Platform;
use crate::server::AppState;

/// Request body for initiating an authorization flow
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct InitiateAuthorizationRequest {
    /// Client platform the flow is started from
    pub platform: Platform,
    /// Requested OAuth scopes; empty means provider defaults
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A freshly initiated authorization session
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InitiateAuthorizationResponse {
    /// Session identifier to correlate the callback with
    #[schema(value_type = String)]
    pub session_id: Uuid,
    /// Anti-forgery state token embedded in the authorization URL
    pub state: String,
    /// Provider authorization URL to redirect the user to
    pub authorize_url: String,
    /// When the pending session expires
    pub expires_at: DateTime<Utc>,
}

impl From<InitiatedAuthorization> for InitiateAuthorizationResponse {
    fn from(initiated: InitiatedAuthorization) -> Self {
        Self {
            session_id: initiated.session_id,
            state: initiated.state,
            authorize_url: initiated.authorize_url,
            expires_at: initiated.expires_at,
        }
    }
}

/// Request body for the OAuth callback
#[derive(Debug, Deserialize, Serialize, ToSchema)]
pub struct OauthCallbackRequest {
    /// Authorization code returned by the provider
    pub code: String,
    /// State token from the original authorization URL
    pub state: String,
    /// Optional session id for an extra correlation check
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub session_id: Option<Uuid>,
}

/// Connection established by a successful code exchange
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OauthCallbackResponse {
    /// Identifier of the created or reconnected connection
    #[schema(value_type = String)]
    pub connection_id: Uuid,
    /// Provider slug the connection belongs to
    pub provider: String,
    /// Scopes actually granted by the provider
    pub granted_scopes: Vec<String>,
    /// User identifier at the provider
    pub external_id: String,
    /// Display name reported by the provider, when available
    pub display_name: Option<String>,
}

impl From<CompletedAuthorization> for OauthCallbackResponse {
    fn from(completed: CompletedAuthorization) -> Self {
        Self {
            connection_id: completed.connection_id,
            provider: completed.provider_slug,
            granted_scopes: completed.granted_scopes,
            external_id: completed.external_id,
            display_name: completed.display_name,
        }
    }
}

/// Response confirming a session cancellation
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelSessionResponse {
    /// Identifier of the cancelled session
    #[schema(value_type = String)]
    pub session_id: Uuid,
    pub cancelled: bool,
}

/// Starts an authorization flow against a provider
#[utoipa::path(
    post,
    path = "/authorize/{provider}",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("provider" = String, Path, description = "Provider slug, e.g. `spotify`")
    ),
    request_body = InitiateAuthorizationRequest,
    responses(
        (status = 200, description = "Authorization session created", body = InitiateAuthorizationResponse, example = json!({
            "session_id": "550e8400-e29b-41d4-a716-446655440000",
            "state": "mB3c9…",
            "authorize_url": "https://accounts.spotify.com/authorize?response_type=code&…",
            "expires_at": "2025-01-01T12:10:00Z"
        })),
        (status = 400, description = "Unknown provider, platform, or scopes", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 503, description = "Provider unavailable", body = ApiError)
    ),
    tag = "authorization"
)]
pub async fn initiate_authorization(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(provider): Path<String>,
    Json(request): Json<InitiateAuthorizationRequest>,
) -> Result<Json<InitiateAuthorizationResponse>, ApiError> {
    let initiated = state
        .sessions
        .initiate(user.0, &provider, request.platform, request.scopes)
        .await?;
    Ok(Json(initiated.into()))
}

/// Completes an authorization flow with the provider's callback parameters
#[utoipa::path(
    post,
    path = "/oauth/callback",
    security(("bearer_auth" = [])),
    params(UserHeader),
    request_body = OauthCallbackRequest,
    responses(
        (status = 200, description = "Connection established", body = OauthCallbackResponse),
        (status = 400, description = "Unknown state or session mismatch", body = ApiError),
        (status = 401, description = "Code exchange rejected by the provider", body = ApiError),
        (status = 410, description = "Session expired before the callback arrived", body = ApiError),
        (status = 504, description = "Provider timed out during the exchange", body = ApiError)
    ),
    tag = "authorization"
)]
pub async fn oauth_callback(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(_user): UserExtension,
    Json(request): Json<OauthCallbackRequest>,
) -> Result<Json<OauthCallbackResponse>, ApiError> {
    // The session located by the state token is authoritative for the user.
    let completed = state
        .sessions
        .handle_callback(&request.code, &request.state, request.session_id)
        .await?;
    Ok(Json(completed.into()))
}

/// Cancels a pending authorization session
#[utoipa::path(
    post,
    path = "/authorize/sessions/{session_id}/cancel",
    security(("bearer_auth" = [])),
    params(
        UserHeader,
        ("session_id" = String, Path, description = "Authorization session identifier")
    ),
    responses(
        (status = 200, description = "Session cancelled", body = CancelSessionResponse),
        (status = 400, description = "Session already finished", body = ApiError),
        (status = 401, description = "Unauthorized", body = ApiError),
        (status = 404, description = "Session not found", body = ApiError)
    ),
    tag = "authorization"
)]
pub async fn cancel_session(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    UserExtension(user): UserExtension,
    Path(session_id): Path<Uuid>,
) -> Result<Json<CancelSessionResponse>, ApiError> {
    state.sessions.cancel(user.0, session_id).await?;
    Ok(Json(CancelSessionResponse {
        session_id,
        cancelled: true,
    }))
}
