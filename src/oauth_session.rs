//! # OAuth Session Manager
//!
//! Drives the PKCE authorization handshake end to end: one state machine
//! instance per (user, provider) pair. Starting a new flow supersedes any
//! live session for the pair; callbacks are matched by the anti-forgery
//! state token; expired or terminal sessions never reach the token exchange.
//!
//! Every transition emits a `oauth_session_<transition>` security event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::audit::{SecurityAuditLogger, risk};
use crate::config::AppConfig;
use crate::connection_store::ConnectionStore;
use crate::error::ServiceError;
use crate::models::auth_session::{self, SessionStatus};
use crate::pkce;
use crate::providers::{ExchangeCodeParams, Platform, ProviderError, ProviderRegistry};
use crate::repositories::AuthSessionRepository;

/// Callback attempts tolerated per session before it is failed outright.
const MAX_CALLBACK_ATTEMPTS: i32 = 3;

/// Everything a caller needs to send the user to the provider.
#[derive(Debug)]
pub struct InitiatedAuthorization {
    pub session_id: Uuid,
    pub state: String,
    pub authorize_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Connection summary returned after a successful code exchange.
#[derive(Debug)]
pub struct CompletedAuthorization {
    pub connection_id: Uuid,
    pub provider_slug: String,
    pub granted_scopes: Vec<String>,
    pub external_id: String,
    pub display_name: Option<String>,
}

pub struct OauthSessionManager {
    config: Arc<AppConfig>,
    sessions: AuthSessionRepository,
    store: Arc<ConnectionStore>,
    registry: Arc<ProviderRegistry>,
    audit: Arc<SecurityAuditLogger>,
}

impl OauthSessionManager {
    pub fn new(
        config: Arc<AppConfig>,
        sessions: AuthSessionRepository,
        store: Arc<ConnectionStore>,
        registry: Arc<ProviderRegistry>,
        audit: Arc<SecurityAuditLogger>,
    ) -> Self {
        Self {
            config,
            sessions,
            store,
            registry,
            audit,
        }
    }

    /// Start an authorization flow: validate the provider, supersede any
    /// live session for the pair, generate PKCE material and hand back the
    /// provider's authorization URL.
    #[instrument(skip(self, scopes), fields(user_id = %user_id, provider = %provider_slug))]
    pub async fn initiate(
        &self,
        user_id: Uuid,
        provider_slug: &str,
        platform: Platform,
        scopes: Vec<String>,
    ) -> Result<InitiatedAuthorization, ServiceError> {
        let descriptor = self.registry.ensure_available(provider_slug)?;
        if !descriptor.enabled_for(platform) {
            return Err(ServiceError::InvalidRequest(format!(
                "provider '{}' is not enabled for platform {:?}",
                provider_slug, platform
            )));
        }
        if !descriptor.supports_scopes(&scopes) {
            return Err(ServiceError::InvalidRequest(format!(
                "requested scopes are not supported by provider '{}'",
                provider_slug
            )));
        }
        let client_id = self
            .config
            .providers
            .get(provider_slug)
            .and_then(|p| p.client_id.clone())
            .ok_or_else(|| {
                ServiceError::InvalidRequest(format!(
                    "provider '{}' has no client credentials configured",
                    provider_slug
                ))
            })?;

        // At most one live session per (user, provider): a new initiate
        // supersedes the old flow instead of racing it.
        if let Some(live) = self.sessions.find_live(user_id, provider_slug).await? {
            info!(superseded_session = %live.id, "superseding live authorization session");
            self.sessions
                .transition(live, SessionStatus::Cancelled, Some("superseded".into()))
                .await?;
            self.emit(user_id, provider_slug, "cancelled", json!({ "reason": "superseded" }))
                .await?;
        }

        let pair = pkce::generate_pkce_pair();
        let state = pkce::generate_state_token();
        let ttl_seconds = self.config.oauth.session_ttl_seconds as i64;
        let scopes_json = if scopes.is_empty() {
            None
        } else {
            Some(json!(scopes))
        };

        let session = self
            .sessions
            .create(
                user_id,
                provider_slug,
                &state,
                &pair.verifier,
                scopes_json,
                ttl_seconds,
            )
            .await?;

        let authorize_url = build_authorize_url(
            &descriptor.auth_url,
            &client_id,
            &self.config.oauth.redirect_url,
            &state,
            &pair.challenge,
            &scopes,
        )?;

        counter!("oauth_sessions_initiated_total").increment(1);
        self.emit(user_id, provider_slug, "initiated", json!({ "session_id": session.id }))
            .await?;

        Ok(InitiatedAuthorization {
            session_id: session.id,
            state,
            authorize_url: authorize_url.to_string(),
            expires_at: session.expires_at,
        })
    }

    /// Complete the flow: match the callback to its session by state token,
    /// then exchange the code and stored verifier for tokens.
    #[instrument(skip(self, code, state))]
    pub async fn handle_callback(
        &self,
        code: &str,
        state: &str,
        session_id: Option<Uuid>,
    ) -> Result<CompletedAuthorization, ServiceError> {
        let session = self
            .sessions
            .find_by_state(state)
            .await?
            .ok_or_else(|| ServiceError::InvalidRequest("unknown state token".into()))?;
        if let Some(expected) = session_id
            && expected != session.id
        {
            return Err(ServiceError::InvalidRequest(
                "session id does not match state token".into(),
            ));
        }
        if session.status.is_terminal() {
            return Err(ServiceError::InvalidRequest(
                "authorization session is already finished".into(),
            ));
        }

        let session = self.sessions.increment_attempts(session).await?;
        if session.attempts > MAX_CALLBACK_ATTEMPTS {
            warn!(session_id = %session.id, "too many callback attempts");
            let (user_id, provider) = (session.user_id, session.provider_slug.clone());
            self.sessions
                .transition(
                    session,
                    SessionStatus::Error,
                    Some("too many callback attempts".into()),
                )
                .await?;
            self.emit(user_id, &provider, "error", json!({ "reason": "attempt limit" }))
                .await?;
            return Err(ServiceError::AuthorizationFailed(
                "too many callback attempts".into(),
            ));
        }

        if Utc::now() > session.expires_at {
            // Lazy reap: the flow lapsed, no exchange is attempted.
            let (user_id, provider) = (session.user_id, session.provider_slug.clone());
            self.sessions
                .transition(session, SessionStatus::Expired, None)
                .await?;
            self.emit(user_id, &provider, "expired", json!({}))
                .await?;
            return Err(ServiceError::SessionExpired);
        }

        let verifier = session.code_verifier.clone().ok_or_else(|| {
            ServiceError::InvalidRequest("authorization session holds no verifier".into())
        })?;
        let user_id = session.user_id;
        let provider_slug = session.provider_slug.clone();

        // Leaving `initiated` drops the stored verifier; from here the
        // session carries no secret material.
        let session = self
            .sessions
            .transition(session, SessionStatus::Authorized, None)
            .await?;
        self.emit(user_id, &provider_slug, "authorized", json!({ "session_id": session.id }))
            .await?;

        let provider = self.registry.get(&provider_slug)?;
        let exchange = provider
            .exchange_code(ExchangeCodeParams {
                code: code.to_string(),
                code_verifier: verifier,
                redirect_uri: self.config.oauth.redirect_url.clone(),
            })
            .await;

        match exchange {
            Ok(grant) => {
                let granted_scopes = grant.granted_scopes.clone();
                let connection = self
                    .store
                    .upsert_from_exchange(user_id, &provider_slug, grant)
                    .await?;
                self.sessions
                    .transition(session, SessionStatus::Completed, None)
                    .await?;
                counter!("oauth_sessions_completed_total").increment(1);
                self.emit(
                    user_id,
                    &provider_slug,
                    "completed",
                    json!({ "connection_id": connection.id }),
                )
                .await?;
                Ok(CompletedAuthorization {
                    connection_id: connection.id,
                    provider_slug,
                    granted_scopes,
                    external_id: connection.external_id,
                    display_name: connection.display_name,
                })
            }
            Err(err) => {
                error!(error = %err, "token exchange failed");
                self.sessions
                    .transition(session, SessionStatus::Error, Some(err.to_string()))
                    .await?;
                counter!("oauth_sessions_failed_total").increment(1);
                self.emit(
                    user_id,
                    &provider_slug,
                    "error",
                    json!({ "detail": err.to_string() }),
                )
                .await?;
                match err {
                    ProviderError::Network { timed_out: true, .. } => {
                        Err(ServiceError::NetworkTimeout)
                    }
                    other => Err(ServiceError::AuthorizationFailed(other.to_string())),
                }
            }
        }
    }

    /// Cancel a pending flow (user denial or explicit abort); no token
    /// exchange is attempted.
    #[instrument(skip(self), fields(user_id = %user_id, session_id = %session_id))]
    pub async fn cancel(&self, user_id: Uuid, session_id: Uuid) -> Result<(), ServiceError> {
        let session = self
            .sessions
            .find_by_id(user_id, session_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("auth session '{}'", session_id)))?;
        if session.status.is_terminal() {
            return Err(ServiceError::InvalidRequest(
                "authorization session is already finished".into(),
            ));
        }
        let provider = session.provider_slug.clone();
        self.sessions
            .transition(session, SessionStatus::Cancelled, None)
            .await?;
        self.emit(user_id, &provider, "cancelled", json!({ "session_id": session_id }))
            .await?;
        Ok(())
    }

    /// Expire all overdue live sessions. Returns how many were reaped.
    pub async fn sweep(&self) -> Result<usize, ServiceError> {
        let reaped = self.sessions.sweep_expired().await?;
        for session in &reaped {
            self.emit(
                session.user_id,
                &session.provider_slug,
                "expired",
                json!({ "session_id": session.id, "swept": true }),
            )
            .await?;
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "swept expired authorization sessions");
            counter!("oauth_sessions_swept_total").increment(reaped.len() as u64);
        }
        Ok(reaped.len())
    }

    /// Run the periodic session sweep until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        info!("Starting auth session sweeper");
        let tick_interval = TokioDuration::from_secs(self.config.oauth.sweep_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Auth session sweeper shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    if let Err(err) = self.sweep().await {
                        error!(error = ?err, "Auth session sweep failed");
                    }
                }
            }
        }

        info!("Auth session sweeper stopped");
    }

    async fn emit(
        &self,
        user_id: Uuid,
        provider_slug: &str,
        transition: &str,
        mut metadata: serde_json::Value,
    ) -> Result<(), ServiceError> {
        if let Some(object) = metadata.as_object_mut() {
            object.insert("provider".to_string(), json!(provider_slug));
        }
        let risk_level = match transition {
            "error" => risk::LOW,
            _ => risk::INFO,
        };
        self.audit
            .record(
                Some(user_id),
                &format!("oauth_session_{}", transition),
                risk_level,
                "authorization session transition",
                metadata,
            )
            .await?;
        Ok(())
    }
}

/// Assemble the provider authorization URL with PKCE and anti-forgery
/// parameters, then validate it meets OAuth 2.0 requirements: HTTPS, valid
/// per RFC 3986, no fragment, at most 2048 characters.
fn build_authorize_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
    scopes: &[String],
) -> Result<Url, ServiceError> {
    let mut url = Url::parse(auth_url).map_err(|err| {
        ServiceError::Internal(anyhow::anyhow!("provider auth URL is invalid: {}", err))
    })?;
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
    if !scopes.is_empty() {
        url.query_pairs_mut()
            .append_pair("scope", &scopes.join(" "));
    }

    if url.scheme() != "https" {
        return Err(ServiceError::Internal(anyhow::anyhow!(
            "authorization URL must use HTTPS"
        )));
    }
    if url.fragment().is_some() {
        return Err(ServiceError::Internal(anyhow::anyhow!(
            "authorization URL must not include a fragment"
        )));
    }
    if url.as_str().len() > 2048 {
        return Err(ServiceError::Internal(anyhow::anyhow!(
            "authorization URL exceeds maximum length of 2048 characters"
        )));
    }
    Ok(url)
}
