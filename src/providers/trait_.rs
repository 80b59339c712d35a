//! Provider trait definition
//!
//! Defines the standard interface every music-provider implementation must
//! follow, plus the structured error types shared by the sync pipeline.

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::SecretToken;

/// Provider-level error types for structured error handling
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Unexpected HTTP status from the provider
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Response body could not be parsed
    #[error("malformed provider response: {details}")]
    MalformedResponse { details: String },
    /// Network or connectivity error; `timed_out` marks deadline expiry
    #[error("network error talking to provider: {details}")]
    Network { details: String, timed_out: bool },
    /// The provider rejected the presented grant or token
    #[error("provider rejected the grant: {details}")]
    GrantRejected {
        details: String,
        error_code: Option<String>,
    },
    /// Rate limiting with an optional retry-after hint
    #[error("provider rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ProviderError::MalformedResponse {
                details: error.to_string(),
            }
        } else {
            ProviderError::Network {
                details: error.to_string(),
                timed_out: error.is_timeout(),
            }
        }
    }
}

/// Item-level error classification recorded in a sync job's error log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Authentication/authorization failure
    Unauthorized,
    /// Rate limited with optional retry after hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Transient/retryable error
    Transient,
    /// Permanent/non-retryable error
    Permanent,
}

impl SyncError {
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Unauthorized,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: SyncErrorKind::RateLimited { retry_after_secs },
            message: None,
            details: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Transient,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Permanent,
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether retrying the same item later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::Transient | SyncErrorKind::RateLimited { .. }
        )
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SyncErrorKind::Unauthorized => write!(f, "Unauthorized")?,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            SyncErrorKind::Transient => write!(f, "Transient error")?,
            SyncErrorKind::Permanent => write!(f, "Permanent error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<ProviderError> for SyncError {
    fn from(provider_error: ProviderError) -> Self {
        match provider_error {
            ProviderError::RateLimited { retry_after_secs } => {
                SyncError::rate_limited(retry_after_secs)
            }
            ProviderError::GrantRejected { details, .. } => SyncError::unauthorized(details),
            ProviderError::Network { details, .. } => SyncError::transient(details),
            ProviderError::Http { status, body } => {
                if status == 429 {
                    SyncError::rate_limited(None)
                } else if (400..500).contains(&status) {
                    SyncError::permanent(format!("HTTP error {}: {}", status, body))
                } else {
                    SyncError::transient(format!("HTTP error {}: {}", status, body))
                }
            }
            ProviderError::MalformedResponse { details } => {
                SyncError::transient(format!("Malformed response: {}", details))
            }
        }
    }
}

/// Cursor for pagination in sync operations.
///
/// Wraps an opaque JSON payload returned by providers. The payload may be a
/// primitive or structured object and must round-trip without alteration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Cursor(pub serde_json::Value);

impl Cursor {
    /// Construct a cursor from any JSON value.
    pub fn from_json(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Convenience helper to build a string cursor.
    pub fn from_string<S: Into<String>>(value: S) -> Self {
        Self(serde_json::Value::String(value.into()))
    }

    /// Borrow the underlying JSON value.
    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Attempt to access the cursor as a string.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl From<Cursor> for serde_json::Value {
    fn from(cursor: Cursor) -> Self {
        cursor.0
    }
}

impl From<serde_json::Value> for Cursor {
    fn from(value: serde_json::Value) -> Self {
        Cursor::from_json(value)
    }
}

/// Token material returned by a successful exchange or refresh.
///
/// Providers may also report profile fields used for connection display;
/// both are optional because not every provider returns them inline.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: SecretToken,
    pub refresh_token: Option<SecretToken>,
    pub expires_in_secs: Option<u64>,
    pub granted_scopes: Vec<String>,
    pub external_id: Option<String>,
    pub display_name: Option<String>,
}

/// Parameters for exchanging an authorization code
#[derive(Debug)]
pub struct ExchangeCodeParams {
    pub code: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

/// Parameters for fetching one page of items from a provider collection
#[derive(Debug)]
pub struct FetchParams {
    pub access_token: SecretToken,
    pub collection: String,
    pub cursor: Option<Cursor>,
    pub limit: u32,
}

/// One item pulled from a provider collection
#[derive(Debug, Clone)]
pub struct ProviderItem {
    pub external_id: String,
    pub payload: serde_json::Value,
}

/// Result of fetching one page from a provider collection
#[derive(Debug)]
pub struct FetchPage {
    pub items: Vec<ProviderItem>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
    pub estimated_total: Option<u64>,
}

#[async_trait]
pub trait MusicProvider: Send + Sync {
    /// Exchange an authorization code plus PKCE verifier for tokens.
    async fn exchange_code(&self, params: ExchangeCodeParams) -> Result<TokenGrant, ProviderError>;

    /// Obtain a fresh access token from a stored refresh token.
    async fn refresh_token(&self, refresh_token: &SecretToken)
    -> Result<TokenGrant, ProviderError>;

    /// Best-effort revocation of a token at the provider.
    async fn revoke_token(&self, token: &SecretToken) -> Result<(), ProviderError>;

    /// Fetch one page of items from a named collection.
    async fn fetch_page(&self, params: FetchParams) -> Result<FetchPage, ProviderError>;
}
