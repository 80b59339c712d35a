//! # Error Handling
//!
//! This module provides unified error handling for the tunesync service:
//! a domain-level `ServiceError` taxonomy and a problem+json `ApiError`
//! response format with trace ID propagation.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::sync_job::JobStatus;
use crate::telemetry;

/// Domain error taxonomy for the connection lifecycle and sync engine.
///
/// Callers must be able to distinguish "reconnect your account"
/// (`ReauthorizationRequired`) from "try again later"
/// (`ProviderUnavailable`, `NetworkTimeout`).
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or unknown provider, scope, or session reference
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The time-boxed authorization flow lapsed
    #[error("authorization session expired")]
    SessionExpired,
    /// Provider rejected the code/state, or the user denied access
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),
    /// Refresh token revoked or expired; the user must restart the OAuth flow
    #[error("reauthorization required")]
    ReauthorizationRequired,
    /// Registry marks the provider down or in maintenance
    #[error("provider '{0}' is unavailable")]
    ProviderUnavailable(String),
    /// A non-terminal job already exists for the connection
    #[error("a sync job is already running for this connection")]
    SyncAlreadyRunning { job_id: Uuid, status: JobStatus },
    /// A network deadline was exceeded; retryable with backoff
    #[error("network timeout talking to the provider")]
    NetworkTimeout,
    /// A sync phase made no progress within its configured timeout
    #[error("phase '{0}' timed out without progress")]
    PhaseTimeout(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Database(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Whether a caller may retry the operation later without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::NetworkTimeout | Self::Database(_)
        )
    }

    /// Error code string exposed in problem+json responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::AuthorizationFailed(_) => "AUTHORIZATION_FAILED",
            Self::ReauthorizationRequired => "REAUTHORIZATION_REQUIRED",
            Self::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Self::SyncAlreadyRunning { .. } => "SYNC_ALREADY_RUNNING",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::PhaseTimeout(_) => "PHASE_TIMEOUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Database(_) | Self::Crypto(_) | Self::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::SessionExpired => StatusCode::GONE,
            Self::AuthorizationFailed(_) | Self::ReauthorizationRequired => {
                StatusCode::UNAUTHORIZED
            }
            Self::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SyncAlreadyRunning { .. } => StatusCode::CONFLICT,
            Self::NetworkTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::PhaseTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Database(_) | Self::Crypto(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Extract current trace ID from the active tracing span (falls back to generated correlation ID)
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                // Fallback: generate a correlation ID for basic client-server log correlation
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        // Add Retry-After header if present
        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

// Error mappers for common sources

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        let code = error.code();

        match error {
            ServiceError::SyncAlreadyRunning { job_id, status: job_status } => {
                ApiError::new(status, code, "a sync job is already running for this connection")
                    .with_details(json!({
                        "job_id": job_id,
                        "status": job_status,
                    }))
            }
            ServiceError::ProviderUnavailable(ref provider) => {
                let message = error.to_string();
                ApiError::new(status, code, &message)
                    .with_details(json!({ "provider": provider }))
                    .with_retry_after(300)
            }
            ServiceError::Database(db_err) => db_err.into(),
            ServiceError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                ApiError::new(status, code, "An internal error occurred")
            }
            ServiceError::Crypto(err) => {
                tracing::error!("Crypto error: {}", err);
                ApiError::new(status, code, "An internal error occurred")
            }
            other => {
                let message = other.to_string();
                ApiError::new(status, code, &message)
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        // Log the full error for debugging
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create an unauthorized error (401) with explicit trace_id
pub fn unauthorized_with_trace_id(message: Option<&str>, trace_id: String) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    let mut error = ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg);
    error.trace_id = Some(trace_id.into_boxed_str());
    error
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "Test error");

        assert_eq!(error.code, Box::from("INVALID_REQUEST"));
        assert_eq!(error.message, Box::from("Test error"));
        assert!(error.details.is_none());
        assert_eq!(error.retry_after, None);
        assert!(error.trace_id.is_some());
    }

    #[test]
    fn test_taxonomy_codes_and_statuses() {
        let cases: Vec<(ServiceError, StatusCode, &str)> = vec![
            (
                ServiceError::InvalidRequest("bad scope".into()),
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
            ),
            (ServiceError::SessionExpired, StatusCode::GONE, "SESSION_EXPIRED"),
            (
                ServiceError::AuthorizationFailed("denied".into()),
                StatusCode::UNAUTHORIZED,
                "AUTHORIZATION_FAILED",
            ),
            (
                ServiceError::ReauthorizationRequired,
                StatusCode::UNAUTHORIZED,
                "REAUTHORIZATION_REQUIRED",
            ),
            (
                ServiceError::ProviderUnavailable("spotify".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "PROVIDER_UNAVAILABLE",
            ),
            (ServiceError::NetworkTimeout, StatusCode::GATEWAY_TIMEOUT, "NETWORK_TIMEOUT"),
            (
                ServiceError::PhaseTimeout("data_fetch".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "PHASE_TIMEOUT",
            ),
            (
                ServiceError::NotFound("connection".into()),
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
        ];

        for (err, expected_status, expected_code) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.status, expected_status);
            assert_eq!(api.code.as_ref(), expected_code);
        }
    }

    #[test]
    fn test_sync_already_running_carries_job_details() {
        let job_id = Uuid::new_v4();
        let err = ServiceError::SyncAlreadyRunning {
            job_id,
            status: JobStatus::InProgress,
        };
        let api: ApiError = err.into();

        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.code.as_ref(), "SYNC_ALREADY_RUNNING");
        let details = api.details.expect("details present");
        assert_eq!(details["job_id"], json!(job_id));
        assert_eq!(details["status"], json!("in_progress"));
    }

    #[test]
    fn test_provider_unavailable_sets_retry_after() {
        let err = ServiceError::ProviderUnavailable("tidal".into());
        let api: ApiError = err.into();

        assert_eq!(api.retry_after, Some(300));
        let response = api.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "300");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn test_retryability_classification() {
        assert!(ServiceError::NetworkTimeout.is_retryable());
        assert!(ServiceError::ProviderUnavailable("x".into()).is_retryable());
        assert!(!ServiceError::ReauthorizationRequired.is_retryable());
        assert!(!ServiceError::SessionExpired.is_retryable());
        assert!(!ServiceError::AuthorizationFailed("no".into()).is_retryable());
        assert!(!ServiceError::PhaseTimeout("processing".into()).is_retryable());
    }

    #[test]
    fn test_from_anyhow() {
        let api: ApiError = anyhow::anyhow!("boom").into();
        assert_eq!(api.code, Box::from("INTERNAL_SERVER_ERROR"));
        assert_eq!(api.message, Box::from("An internal error occurred"));
    }

    #[test]
    fn test_database_error_mapping() {
        let db_error = sea_orm::DbErr::RecordNotFound("sync_job".to_string());
        let api: ApiError = db_error.into();

        assert_eq!(api.status, StatusCode::NOT_FOUND);
        assert_eq!(api.code, Box::from("NOT_FOUND"));
        assert!(api.message.contains("sync_job"));
    }

    #[test]
    fn test_status_code_preservation() {
        let error = ApiError::new(StatusCode::CONFLICT, "CONFLICT", "already exists");
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_trace_id_generation() {
        let error = ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "Test error",
        );

        let trace_id = error.trace_id.expect("trace id generated");
        assert!(trace_id.starts_with("corr-"));
        assert_eq!(trace_id.len(), 13); // "corr-" + 8 chars
    }

    #[test]
    fn test_validation_error_with_details() {
        let field_errors = json!({ "scopes": "unknown scope 'library:write'" });
        let error = validation_error("Validation failed", field_errors.clone());

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, Box::from("INVALID_REQUEST"));
        assert_eq!(error.details, Some(Box::new(field_errors)));
    }
}
