//! # Connection Store
//!
//! Single writer of token material and connection lifecycle transitions.
//! Every other component treats tokens as opaque and obtains them only
//! through [`ConnectionStore::get_valid_token`], which refreshes inline when
//! the stored access token is within the configured expiry skew.
//!
//! Concurrent refreshes for one connection coalesce into a single in-flight
//! call: callers serialize on a per-connection lock and re-check expiry after
//! acquiring it, so a refresh that just completed is reused instead of
//! repeated. Some providers invalidate the previous refresh token on use,
//! which makes parallel refreshes actively destructive.
//!
//! A background task scans for connections whose tokens are about to expire
//! and refreshes them ahead of demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use sea_orm::Set;
use serde_json::json;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{SecurityAuditLogger, risk};
use crate::config::AppConfig;
use crate::crypto::SecretToken;
use crate::error::ServiceError;
use crate::models::connection::{self, ConnectionStatus};
use crate::providers::{ProviderError, ProviderRegistry, TokenGrant};
use crate::repositories::ConnectionRepository;

/// Outcome of a disconnect request.
#[derive(Debug)]
pub struct DisconnectOutcome {
    pub disconnected_at: DateTime<Utc>,
    pub revoked_from_provider: bool,
}

#[derive(Debug, Default)]
struct RefreshStats {
    connections_polled: u64,
    refreshes_attempted: u64,
    refreshes_succeeded: u64,
    refreshes_failed: u64,
    skipped_backing_off: u64,
}

pub struct ConnectionStore {
    config: Arc<AppConfig>,
    repo: ConnectionRepository,
    registry: Arc<ProviderRegistry>,
    audit: Arc<SecurityAuditLogger>,
    /// Per-connection refresh locks providing single-flight coalescing
    refresh_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionStore {
    pub fn new(
        config: Arc<AppConfig>,
        repo: ConnectionRepository,
        registry: Arc<ProviderRegistry>,
        audit: Arc<SecurityAuditLogger>,
    ) -> Self {
        Self {
            config,
            repo,
            registry,
            audit,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &ConnectionRepository {
        &self.repo
    }

    /// Create or replace the connection for a `(user, provider)` pair from a
    /// successful token exchange. Reconnecting reuses the existing row so
    /// sync history stays attached to the same connection id.
    #[instrument(skip(self, grant), fields(user_id = %user_id, provider = %provider_slug))]
    pub async fn upsert_from_exchange(
        &self,
        user_id: Uuid,
        provider_slug: &str,
        grant: TokenGrant,
    ) -> Result<connection::Model, ServiceError> {
        // Providers that do not report an account id get a stable per-user
        // placeholder so the crypto AAD binding still holds.
        let external_id = grant
            .external_id
            .clone()
            .unwrap_or_else(|| format!("user-{}", user_id));
        let expires_at = expiry_from_grant(&grant);
        let scopes = if grant.granted_scopes.is_empty() {
            None
        } else {
            Some(json!(grant.granted_scopes))
        };

        let existing = self
            .repo
            .find_by_user_and_provider(&user_id, provider_slug)
            .await?;

        let connection = match existing {
            Some(existing) => {
                debug!(connection_id = %existing.id, "replacing connection from reconnect");
                self.repo
                    .apply_reconnect(
                        &existing.id,
                        &external_id,
                        grant.display_name.clone(),
                        scopes,
                    )
                    .await?;
                self.repo
                    .store_tokens(
                        &existing.id,
                        Some(&grant.access_token),
                        grant.refresh_token.as_ref(),
                        expires_at,
                    )
                    .await?
            }
            None => {
                let now = Utc::now();
                let model = connection::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    user_id: Set(user_id),
                    provider_slug: Set(provider_slug.to_string()),
                    external_id: Set(external_id),
                    display_name: Set(grant.display_name.clone()),
                    status: Set(ConnectionStatus::Connected),
                    access_token_ciphertext: Set(None),
                    refresh_token_ciphertext: Set(None),
                    token_expires_at: Set(expires_at.map(Into::into)),
                    scopes: Set(scopes),
                    consecutive_errors: Set(0),
                    retry_count: Set(0),
                    backoff_delay_seconds: Set(0),
                    last_sync_at: Set(None),
                    success_rate: Set(1.0),
                    avg_response_ms: Set(0.0),
                    created_at: Set(now.into()),
                    updated_at: Set(now.into()),
                };
                self.repo
                    .create_with_tokens(
                        model,
                        Some(&grant.access_token),
                        grant.refresh_token.as_ref(),
                    )
                    .await?
            }
        };

        counter!("connections_upserted_total").increment(1);
        self.audit
            .record(
                Some(user_id),
                "connection_connected",
                risk::INFO,
                "connection established from token exchange",
                json!({ "provider": provider_slug, "connection_id": connection.id }),
            )
            .await?;
        Ok(connection)
    }

    /// Return a usable access token for the connection, refreshing inline
    /// when the stored one is within the expiry skew.
    pub async fn get_valid_token(&self, connection_id: Uuid) -> Result<SecretToken, ServiceError> {
        let connection = self
            .repo
            .get_by_id(&connection_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection '{}'", connection_id)))?;
        self.ensure_refreshable(&connection)?;

        let skew = self.config.token_refresh.expiry_skew_seconds as i64;
        if let Some(token) = self.usable_access_token(&connection, skew)? {
            return Ok(token);
        }

        // Serialize refreshes per connection; whoever wins the lock does the
        // network call and everyone else sees the fresh token on re-check.
        let lock = self.refresh_lock(connection_id);
        let _guard = lock.lock().await;

        let connection = self
            .repo
            .get_by_id(&connection_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection '{}'", connection_id)))?;
        self.ensure_refreshable(&connection)?;
        if let Some(token) = self.usable_access_token(&connection, skew)? {
            return Ok(token);
        }

        let refreshed = self.refresh_now(&connection).await?;
        let (access, _) = self.repo.decrypt_tokens(&refreshed)?;
        access.ok_or(ServiceError::ReauthorizationRequired)
    }

    /// Perform one refresh attempt against the provider and persist the
    /// outcome: new tokens on success, backoff bookkeeping on failure.
    #[instrument(skip(self, connection), fields(connection_id = %connection.id, provider = %connection.provider_slug))]
    async fn refresh_now(
        &self,
        connection: &connection::Model,
    ) -> Result<connection::Model, ServiceError> {
        let (_, refresh_token) = self.repo.decrypt_tokens(connection)?;
        let Some(refresh_token) = refresh_token else {
            warn!("connection has no refresh token, reauthorization required");
            self.repo
                .update_status(&connection.id, ConnectionStatus::Expired)
                .await?;
            self.audit_refresh_outcome(
                connection,
                "token_refresh_rejected",
                risk::HIGH,
                json!({ "reason": "missing refresh token" }),
            )
            .await?;
            return Err(ServiceError::ReauthorizationRequired);
        };

        let provider = self
            .registry
            .get(&connection.provider_slug)
            .map_err(ServiceError::from)?;

        counter!("token_refresh_attempts_total").increment(1);
        let started = std::time::Instant::now();
        match provider.refresh_token(&refresh_token).await {
            Ok(grant) => {
                histogram!("token_refresh_latency_ms")
                    .record(started.elapsed().as_secs_f64() * 1_000.0);
                let expires_at = expiry_from_grant(&grant);
                self.repo
                    .store_tokens(
                        &connection.id,
                        Some(&grant.access_token),
                        grant.refresh_token.as_ref(),
                        expires_at,
                    )
                    .await?;
                let updated = self.repo.reset_refresh_state(&connection.id).await?;
                counter!("token_refresh_success_total").increment(1);
                self.audit_refresh_outcome(connection, "token_refresh_succeeded", risk::INFO, json!({}))
                    .await?;
                Ok(updated)
            }
            Err(error) => {
                counter!("token_refresh_failure_total").increment(1);
                self.handle_refresh_failure(connection, error).await
            }
        }
    }

    /// Classify a refresh failure and persist its consequences.
    ///
    /// Grant rejections mean the refresh token itself is dead: the
    /// connection goes to `expired` and the caller must reauthorize.
    /// Transient failures bump the failure counters with exponential
    /// backoff; crossing the retry ceiling latches `error`, raises an
    /// alert, and suppresses further automatic refreshes.
    async fn handle_refresh_failure(
        &self,
        connection: &connection::Model,
        error: ProviderError,
    ) -> Result<connection::Model, ServiceError> {
        match error {
            ProviderError::GrantRejected {
                details,
                error_code,
            } => {
                warn!(error_code = ?error_code, "refresh token rejected by provider");
                self.repo
                    .update_status(&connection.id, ConnectionStatus::Expired)
                    .await?;
                self.audit_refresh_outcome(
                    connection,
                    "token_refresh_rejected",
                    risk::HIGH,
                    json!({ "error_code": error_code, "details": details }),
                )
                .await?;
                Err(ServiceError::ReauthorizationRequired)
            }
            ProviderError::Http { status, body } if (400..500).contains(&status) => {
                warn!(status, "refresh failed with a non-retryable provider error");
                self.repo
                    .update_status(&connection.id, ConnectionStatus::Expired)
                    .await?;
                self.audit_refresh_outcome(
                    connection,
                    "token_refresh_rejected",
                    risk::HIGH,
                    json!({ "status": status, "body": body }),
                )
                .await?;
                Err(ServiceError::ReauthorizationRequired)
            }
            transient => {
                let refresh = &self.config.token_refresh;
                let failures = connection.consecutive_errors + 1;
                let mut backoff = backoff_delay(
                    refresh.backoff_base_seconds as i64,
                    refresh.backoff_max_seconds as i64,
                    failures,
                );
                if let ProviderError::RateLimited {
                    retry_after_secs: Some(after),
                } = &transient
                {
                    backoff = backoff.max(*after as i64);
                }
                let latch = failures > refresh.max_retries as i32;

                warn!(
                    failures,
                    backoff_seconds = backoff,
                    latched = latch,
                    error = %transient,
                    "transient refresh failure"
                );
                self.repo
                    .record_refresh_failure(&connection.id, backoff, latch)
                    .await?;

                if latch {
                    counter!("token_refresh_suppressed_total").increment(1);
                    self.audit_refresh_outcome(
                        connection,
                        "token_refresh_suppressed",
                        risk::HIGH,
                        json!({ "consecutive_errors": failures }),
                    )
                    .await?;
                    return Err(ServiceError::ReauthorizationRequired);
                }

                self.audit_refresh_outcome(
                    connection,
                    "token_refresh_failed",
                    risk::LOW,
                    json!({ "consecutive_errors": failures, "backoff_seconds": backoff }),
                )
                .await?;
                match transient {
                    ProviderError::Network { timed_out: true, .. } => {
                        Err(ServiceError::NetworkTimeout)
                    }
                    other => Err(ServiceError::Internal(anyhow::Error::new(other))),
                }
            }
        }
    }

    /// Disconnect a connection: best-effort revocation at the provider, then
    /// tokens are discarded while the row is kept for history.
    #[instrument(skip(self), fields(user_id = %user_id, connection_id = %connection_id))]
    pub async fn disconnect(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        reason: &str,
    ) -> Result<DisconnectOutcome, ServiceError> {
        let connection = self
            .repo
            .find_by_id(&user_id, &connection_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection '{}'", connection_id)))?;

        let revoked_from_provider = self.try_revoke_at_provider(&connection).await;
        self.repo.revoke(&user_id, &connection_id).await?;
        counter!("connections_disconnected_total").increment(1);

        let disconnected_at = Utc::now();
        self.audit
            .record(
                Some(user_id),
                "connection_disconnected",
                risk::LOW,
                "connection disconnected and tokens discarded",
                json!({
                    "provider": connection.provider_slug,
                    "connection_id": connection_id,
                    "reason": reason,
                    "revoked_from_provider": revoked_from_provider,
                }),
            )
            .await?;

        Ok(DisconnectOutcome {
            disconnected_at,
            revoked_from_provider,
        })
    }

    /// Attempt token revocation at the provider. Failures are logged, never
    /// propagated: the local revoke must go through regardless.
    async fn try_revoke_at_provider(&self, connection: &connection::Model) -> bool {
        let tokens = match self.repo.decrypt_tokens(connection) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(error = %err, "skipping provider revocation, tokens unreadable");
                return false;
            }
        };
        let (access, refresh) = tokens;
        let Some(token) = refresh.or(access) else {
            return false;
        };
        let provider = match self.registry.get(&connection.provider_slug) {
            Ok(provider) => provider,
            Err(_) => return false,
        };
        match provider.revoke_token(&token).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "provider revocation failed, continuing with local revoke");
                false
            }
        }
    }

    /// Fold a finished sync job into the connection's quality metrics.
    pub async fn record_sync_outcome(
        &self,
        connection_id: Uuid,
        succeeded: bool,
        avg_item_ms: f64,
    ) -> Result<connection::Model, ServiceError> {
        Ok(self
            .repo
            .record_sync_outcome(&connection_id, succeeded, avg_item_ms)
            .await?)
    }

    /// Run the proactive refresh loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run_refresh(&self, shutdown: CancellationToken) {
        info!("Starting token refresh service");
        let tick_seconds = self.config.token_refresh.tick_seconds;

        loop {
            let tick_interval = jittered(tick_seconds, self.config.token_refresh.jitter_factor);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Token refresh service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = std::time::Instant::now();
                    if let Err(err) = self.refresh_tick().await {
                        error!(error = ?err, "Token refresh tick failed");
                    }
                    histogram!("token_refresh_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Token refresh service stopped");
    }

    /// One pass over connections whose tokens are about to expire.
    pub async fn refresh_tick(&self) -> Result<(), ServiceError> {
        let mut stats = RefreshStats::default();
        let skew = self.config.token_refresh.expiry_skew_seconds as i64;
        let due = self.repo.find_due_for_refresh(skew).await?;
        stats.connections_polled = due.len() as u64;

        for connection in due {
            if self.backing_off(&connection) {
                stats.skipped_backing_off += 1;
                continue;
            }
            let lock = self.refresh_lock(connection.id);
            let _guard = lock.lock().await;
            stats.refreshes_attempted += 1;
            match self.refresh_now(&connection).await {
                Ok(_) => stats.refreshes_succeeded += 1,
                Err(err) => {
                    stats.refreshes_failed += 1;
                    debug!(connection_id = %connection.id, error = %err, "background refresh failed");
                }
            }
        }

        gauge!("token_refresh_connections_polled_gauge").set(stats.connections_polled as f64);
        if stats.refreshes_attempted > 0 {
            info!(
                polled = stats.connections_polled,
                attempted = stats.refreshes_attempted,
                succeeded = stats.refreshes_succeeded,
                failed = stats.refreshes_failed,
                backing_off = stats.skipped_backing_off,
                "token refresh tick finished"
            );
        }
        Ok(())
    }

    /// Connections latched into `error` or revoked need user action; no
    /// automatic refresh is attempted for them.
    fn ensure_refreshable(&self, connection: &connection::Model) -> Result<(), ServiceError> {
        match connection.status {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Expired | ConnectionStatus::Revoked | ConnectionStatus::Error => {
                Err(ServiceError::ReauthorizationRequired)
            }
        }
    }

    fn usable_access_token(
        &self,
        connection: &connection::Model,
        skew_seconds: i64,
    ) -> Result<Option<SecretToken>, ServiceError> {
        let fresh = match connection.token_expires_at {
            Some(expires_at) => {
                Utc::now() + Duration::seconds(skew_seconds) < expires_at.with_timezone(&Utc)
            }
            // No reported expiry means the token does not expire.
            None => true,
        };
        if !fresh {
            return Ok(None);
        }
        let (access, _) = self.repo.decrypt_tokens(connection)?;
        Ok(access)
    }

    fn backing_off(&self, connection: &connection::Model) -> bool {
        if connection.backoff_delay_seconds <= 0 {
            return false;
        }
        let resume_at = connection.updated_at.with_timezone(&Utc)
            + Duration::seconds(connection.backoff_delay_seconds);
        Utc::now() < resume_at
    }

    fn refresh_lock(&self, connection_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap();
        locks
            .entry(connection_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn audit_refresh_outcome(
        &self,
        connection: &connection::Model,
        event_type: &str,
        risk_level: i32,
        mut metadata: serde_json::Value,
    ) -> Result<(), ServiceError> {
        if let Some(object) = metadata.as_object_mut() {
            object.insert("provider".to_string(), json!(connection.provider_slug));
            object.insert("connection_id".to_string(), json!(connection.id));
        }
        self.audit
            .record(
                Some(connection.user_id),
                event_type,
                risk_level,
                "token refresh outcome",
                metadata,
            )
            .await?;
        Ok(())
    }
}

/// Exponential backoff with a cap: `min(max, base * 2^n)`.
fn backoff_delay(base_seconds: i64, max_seconds: i64, consecutive_errors: i32) -> i64 {
    let exponent = consecutive_errors.clamp(0, 30) as u32;
    base_seconds
        .saturating_mul(1_i64 << exponent)
        .min(max_seconds)
}

fn expiry_from_grant(grant: &TokenGrant) -> Option<DateTime<Utc>> {
    grant
        .expires_in_secs
        .map(|secs| Utc::now() + Duration::seconds(secs as i64))
}

fn jittered(base_seconds: u64, jitter_factor: f64) -> TokioDuration {
    let jitter_span = (base_seconds as f64 * jitter_factor).max(0.0);
    let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span.max(f64::MIN_POSITIVE));
    let seconds = (base_seconds as f64 + offset).max(1.0);
    TokioDuration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::crypto::CryptoKey;
    use crate::providers::descriptor::{HealthStatus, Platform, ProviderDescriptor};
    use crate::providers::trait_::{
        ExchangeCodeParams, FetchPage, FetchParams, MusicProvider,
    };
    use async_trait::async_trait;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum RefreshBehavior {
        Succeed,
        FailTransient,
        RejectGrant,
    }

    struct ScriptedProvider {
        behavior: RefreshBehavior,
        refresh_calls: AtomicUsize,
        revoke_calls: AtomicUsize,
        refresh_delay: TokioDuration,
    }

    impl ScriptedProvider {
        fn new(behavior: RefreshBehavior) -> Self {
            Self {
                behavior,
                refresh_calls: AtomicUsize::new(0),
                revoke_calls: AtomicUsize::new(0),
                refresh_delay: TokioDuration::from_millis(0),
            }
        }

        fn slow(behavior: RefreshBehavior, delay: TokioDuration) -> Self {
            Self {
                refresh_delay: delay,
                ..Self::new(behavior)
            }
        }
    }

    #[async_trait]
    impl MusicProvider for ScriptedProvider {
        async fn exchange_code(
            &self,
            _params: ExchangeCodeParams,
        ) -> Result<TokenGrant, ProviderError> {
            Ok(TokenGrant {
                access_token: SecretToken::new("exchanged-access"),
                refresh_token: Some(SecretToken::new("exchanged-refresh")),
                expires_in_secs: Some(3600),
                granted_scopes: vec!["library-read".to_string()],
                external_id: Some("acct-1".to_string()),
                display_name: Some("Listener".to_string()),
            })
        }

        async fn refresh_token(
            &self,
            _refresh_token: &SecretToken,
        ) -> Result<TokenGrant, ProviderError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if !self.refresh_delay.is_zero() {
                sleep(self.refresh_delay).await;
            }
            match self.behavior {
                RefreshBehavior::Succeed => Ok(TokenGrant {
                    access_token: SecretToken::new("refreshed-access"),
                    refresh_token: Some(SecretToken::new("refreshed-refresh")),
                    expires_in_secs: Some(3600),
                    granted_scopes: vec![],
                    external_id: None,
                    display_name: None,
                }),
                RefreshBehavior::FailTransient => Err(ProviderError::Network {
                    details: "connection reset".to_string(),
                    timed_out: false,
                }),
                RefreshBehavior::RejectGrant => Err(ProviderError::GrantRejected {
                    details: "refresh token revoked".to_string(),
                    error_code: Some("invalid_grant".to_string()),
                }),
            }
        }

        async fn revoke_token(&self, _token: &SecretToken) -> Result<(), ProviderError> {
            self.revoke_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_page(&self, _params: FetchParams) -> Result<FetchPage, ProviderError> {
            Ok(FetchPage {
                items: vec![],
                next_cursor: None,
                has_more: false,
                estimated_total: Some(0),
            })
        }
    }

    fn test_descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            slug: "spotify".to_string(),
            display_name: "Spotify".to_string(),
            auth_url: "https://accounts.spotify.test/authorize".to_string(),
            token_url: "https://accounts.spotify.test/api/token".to_string(),
            revoke_url: None,
            api_base: None,
            scopes: vec!["library-read".to_string()],
            rate_limit_per_minute: 60,
            platforms: Platform::ALL.to_vec(),
            health: HealthStatus::Healthy,
            maintenance_mode: false,
        }
    }

    async fn store_with_provider(provider: Arc<ScriptedProvider>) -> Arc<ConnectionStore> {
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        Migrator::up(&*db, None).await.unwrap();

        let mut config = AppConfig::default();
        config.token_refresh.backoff_base_seconds = 1;
        config.token_refresh.backoff_max_seconds = 1800;
        config.token_refresh.max_retries = 5;
        let config = Arc::new(config);

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(provider, test_descriptor());

        let audit = Arc::new(SecurityAuditLogger::new(db.clone(), &AuditConfig::default()));
        let repo = ConnectionRepository::new(db, CryptoKey::new(vec![7u8; 32]).unwrap());
        Arc::new(ConnectionStore::new(config, repo, registry, audit))
    }

    fn grant(expires_in_secs: Option<u64>) -> TokenGrant {
        TokenGrant {
            access_token: SecretToken::new("initial-access"),
            refresh_token: Some(SecretToken::new("initial-refresh")),
            expires_in_secs,
            granted_scopes: vec!["library-read".to_string()],
            external_id: Some("acct-1".to_string()),
            display_name: Some("Listener".to_string()),
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let delays: Vec<i64> = (1..=12).map(|n| backoff_delay(1, 1800, n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[0], 2);
        assert_eq!(delays[1], 4);
        assert_eq!(*delays.last().unwrap(), 1800);
    }

    #[tokio::test]
    async fn reconnect_replaces_rather_than_duplicates() {
        let provider = Arc::new(ScriptedProvider::new(RefreshBehavior::Succeed));
        let store = store_with_provider(provider).await;
        let user = Uuid::new_v4();

        let first = store
            .upsert_from_exchange(user, "spotify", grant(Some(3600)))
            .await
            .unwrap();
        let second = store
            .upsert_from_exchange(user, "spotify", grant(Some(3600)))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, ConnectionStatus::Connected);
        assert_eq!(second.consecutive_errors, 0);
        assert_eq!(
            store
                .repository()
                .find_by_user(&user)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let provider = Arc::new(ScriptedProvider::new(RefreshBehavior::Succeed));
        let store = store_with_provider(provider.clone()).await;
        let user = Uuid::new_v4();

        let connection = store
            .upsert_from_exchange(user, "spotify", grant(Some(3600)))
            .await
            .unwrap();

        let token = store.get_valid_token(connection.id).await.unwrap();
        assert_eq!(token.expose(), "initial-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_token_refreshes_once_within_skew() {
        let provider = Arc::new(ScriptedProvider::new(RefreshBehavior::Succeed));
        let store = store_with_provider(provider.clone()).await;
        let user = Uuid::new_v4();

        // expires_in below the 60 s skew forces an inline refresh
        let connection = store
            .upsert_from_exchange(user, "spotify", grant(Some(10)))
            .await
            .unwrap();

        let token = store.get_valid_token(connection.id).await.unwrap();
        assert_eq!(token.expose(), "refreshed-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);

        // Second call inside the skew window reuses the refreshed token.
        let token = store.get_valid_token(connection.id).await.unwrap();
        assert_eq!(token.expose(), "refreshed-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_into_one_call() {
        let provider = Arc::new(ScriptedProvider::slow(
            RefreshBehavior::Succeed,
            TokioDuration::from_millis(100),
        ));
        let store = store_with_provider(provider.clone()).await;
        let user = Uuid::new_v4();

        let connection = store
            .upsert_from_exchange(user, "spotify", grant(Some(10)))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.get_valid_token(connection.id),
            store.get_valid_token(connection.id),
        );
        assert_eq!(a.unwrap().expose(), "refreshed-access");
        assert_eq!(b.unwrap().expose(), "refreshed-access");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_transient_failures_latch_error_and_alert() {
        let provider = Arc::new(ScriptedProvider::new(RefreshBehavior::FailTransient));
        let store = store_with_provider(provider.clone()).await;
        let user = Uuid::new_v4();

        let connection = store
            .upsert_from_exchange(user, "spotify", grant(Some(10)))
            .await
            .unwrap();

        for _ in 0..6 {
            let result = store.get_valid_token(connection.id).await;
            assert!(result.is_err());
        }
        // Latch happens on the sixth failure (max_retries = 5 exceeded).
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 6);

        let latched = store
            .repository()
            .get_by_id(&connection.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latched.status, ConnectionStatus::Error);
        assert_eq!(latched.consecutive_errors, 6);

        // Further calls are suppressed without touching the provider.
        let result = store.get_valid_token(connection.id).await;
        assert!(matches!(result, Err(ServiceError::ReauthorizationRequired)));
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 6);

        // The latch raised an acknowledgeable alert.
        let alerts = store.audit.list_unresolved(risk::HIGH).await.unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn rejected_grant_expires_connection() {
        let provider = Arc::new(ScriptedProvider::new(RefreshBehavior::RejectGrant));
        let store = store_with_provider(provider.clone()).await;
        let user = Uuid::new_v4();

        let connection = store
            .upsert_from_exchange(user, "spotify", grant(Some(10)))
            .await
            .unwrap();

        let result = store.get_valid_token(connection.id).await;
        assert!(matches!(result, Err(ServiceError::ReauthorizationRequired)));

        let expired = store
            .repository()
            .get_by_id(&connection.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.status, ConnectionStatus::Expired);
    }

    #[tokio::test]
    async fn disconnect_revokes_best_effort_and_keeps_history() {
        let provider = Arc::new(ScriptedProvider::new(RefreshBehavior::Succeed));
        let store = store_with_provider(provider.clone()).await;
        let user = Uuid::new_v4();

        let connection = store
            .upsert_from_exchange(user, "spotify", grant(Some(3600)))
            .await
            .unwrap();

        let outcome = store
            .disconnect(user, connection.id, "user request")
            .await
            .unwrap();
        assert!(outcome.revoked_from_provider);
        assert_eq!(provider.revoke_calls.load(Ordering::SeqCst), 1);

        let revoked = store
            .repository()
            .get_by_id(&connection.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revoked.status, ConnectionStatus::Revoked);
        assert!(revoked.access_token_ciphertext.is_none());

        // Disconnected connections refuse token access.
        let result = store.get_valid_token(connection.id).await;
        assert!(matches!(result, Err(ServiceError::ReauthorizationRequired)));
    }
}
