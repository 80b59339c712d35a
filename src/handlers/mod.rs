//! # API Handlers
//!
//! HTTP endpoint handlers for the TuneSync API: authorization flow,
//! connection management, sync control, and the audit surface.

use axum::response::Json;

use crate::models::ServiceInfo;

pub mod audit;
pub mod authorize;
pub mod connections;
pub mod providers;
pub mod sync;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "service"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}
