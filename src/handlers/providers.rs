//! # Provider API Handlers
//!
//! Read-only listing of the configured providers and their current health.

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::{OperatorAuth, UserHeader};
use crate::error::ApiError;
use crate::providers::{Platform, ProviderDescriptor};
use crate::server::AppState;

/// Query parameters for provider listing
#[derive(Debug, Deserialize, Serialize, IntoParams, ToSchema)]
pub struct ListProvidersQuery {
    /// Restrict the listing to providers enabled for this platform
    pub platform: Option<Platform>,
}

/// Response wrapper for provider listing
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProvidersResponse {
    /// Registered providers, sorted by slug
    pub providers: Vec<ProviderDescriptor>,
}

/// Lists registered providers with their descriptors and health
#[utoipa::path(
    get,
    path = "/providers",
    security(("bearer_auth" = [])),
    params(UserHeader, ListProvidersQuery),
    responses(
        (status = 200, description = "Registered providers", body = ProvidersResponse),
        (status = 401, description = "Unauthorized", body = ApiError)
    ),
    tag = "providers"
)]
pub async fn list_providers(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    Query(query): Query<ListProvidersQuery>,
) -> Result<Json<ProvidersResponse>, ApiError> {
    let providers = match query.platform {
        Some(platform) => state.registry.list_enabled(platform),
        None => state.registry.list_descriptors(),
    };
    Ok(Json(ProvidersResponse { providers }))
}
