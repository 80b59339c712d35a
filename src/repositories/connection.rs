//! Connection repository for database operations
//!
//! This module provides the ConnectionRepository struct which encapsulates
//! SeaORM operations for the connections table with user-scoped methods and
//! encrypted token handling.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{CryptoKey, SecretToken, open_connection_tokens, seal_connection_tokens};
use crate::models::connection::{self, ConnectionStatus, Entity as Connection};

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Crypto key for token encryption
    pub crypto_key: CryptoKey,
}

impl ConnectionRepository {
    /// Creates a new ConnectionRepository instance
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Creates a connection with encrypted tokens
    pub async fn create_with_tokens(
        &self,
        mut connection: connection::ActiveModel,
        access_token: Option<&SecretToken>,
        refresh_token: Option<&SecretToken>,
    ) -> Result<connection::Model> {
        let connection_id = connection
            .id
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection id must be set"))?;
        let user_id = connection
            .user_id
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection user_id must be set"))?;
        let provider_slug = connection
            .provider_slug
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection provider_slug must be set"))?;
        let external_id = connection
            .external_id
            .clone()
            .take()
            .ok_or_else(|| anyhow!("connection external_id must be set"))?;

        let (access_ciphertext, refresh_ciphertext) = seal_connection_tokens(
            &self.crypto_key,
            &user_id,
            &provider_slug,
            &external_id,
            access_token,
            refresh_token,
        )
        .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        connection.access_token_ciphertext = Set(access_ciphertext);
        connection.refresh_token_ciphertext = Set(refresh_ciphertext);

        connection.insert(&*self.db).await?;

        // Query back by ID so SQLite behaves the same as Postgres.
        let fetched = Connection::find_by_id(connection_id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("connection not persisted"))
    }

    /// Encrypts the given token pair and stores it on an existing connection
    pub async fn store_tokens(
        &self,
        connection_id: &Uuid,
        access_token: Option<&SecretToken>,
        refresh_token: Option<&SecretToken>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<connection::Model> {
        let connection = self
            .get_by_id(connection_id)
            .await?
            .ok_or_else(|| anyhow!("Connection with ID '{}' not found", connection_id))?;

        let (access_ciphertext, refresh_ciphertext) = seal_connection_tokens(
            &self.crypto_key,
            &connection.user_id,
            &connection.provider_slug,
            &connection.external_id,
            access_token,
            refresh_token,
        )
        .map_err(|e| anyhow!("Token encryption failed: {}", e))?;

        let mut model: connection::ActiveModel = connection.into();
        if let Some(cipher) = access_ciphertext {
            model.access_token_ciphertext = Set(Some(cipher));
        }
        if let Some(cipher) = refresh_ciphertext {
            model.refresh_token_ciphertext = Set(Some(cipher));
        }
        if let Some(expires_at) = expires_at {
            let fixed: DateTimeWithTimeZone = expires_at.into();
            model.token_expires_at = Set(Some(fixed));
        }
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Decrypts the token pair stored on a connection model
    pub fn decrypt_tokens(
        &self,
        connection: &connection::Model,
    ) -> Result<(Option<SecretToken>, Option<SecretToken>)> {
        open_connection_tokens(&self.crypto_key, connection).map_err(|e| {
            // Decryption failures are logged without token details
            tracing::error!(
                user_id = %connection.user_id,
                provider_slug = %connection.provider_slug,
                external_id = %connection.external_id,
                "Token decryption failed"
            );
            anyhow!("Token decryption failed: {}", e)
        })
    }

    /// Finds a connection by its ID within a user scope
    pub async fn find_by_id(
        &self,
        user_id: &Uuid,
        id: &Uuid,
    ) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(*id)
            .filter(connection::Column::UserId.eq(*user_id))
            .one(&*self.db)
            .await?)
    }

    /// Retrieves a connection by its ID without user scoping
    pub async fn get_by_id(&self, id: &Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(*id).one(&*self.db).await?)
    }

    /// Lists all connections for a user ordered by creation time then ID
    pub async fn find_by_user(&self, user_id: &Uuid) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(*user_id))
            .order_by_asc(connection::Column::CreatedAt)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Finds the connection for a `(user, provider)` pair. At most one row
    /// exists per pair; reconnecting updates it in place.
    pub async fn find_by_user_and_provider(
        &self,
        user_id: &Uuid,
        provider_slug: &str,
    ) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(*user_id))
            .filter(connection::Column::ProviderSlug.eq(provider_slug))
            .one(&*self.db)
            .await?)
    }

    /// Reconnect path: refreshes provider-reported profile fields, marks the
    /// connection healthy again and clears the failure counters. Token
    /// ciphertexts are written separately so they stay sealed against the
    /// updated external id.
    pub async fn apply_reconnect(
        &self,
        id: &Uuid,
        external_id: &str,
        display_name: Option<String>,
        scopes: Option<serde_json::Value>,
    ) -> Result<connection::Model> {
        let existing = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Connection '{}' not found", id))?;

        let mut model: connection::ActiveModel = existing.into();
        model.external_id = Set(external_id.to_string());
        if let Some(name) = display_name {
            model.display_name = Set(Some(name));
        }
        if scopes.is_some() {
            model.scopes = Set(scopes);
        }
        model.status = Set(ConnectionStatus::Connected);
        model.consecutive_errors = Set(0);
        model.retry_count = Set(0);
        model.backoff_delay_seconds = Set(0);
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Finds a connection by its unique `(user, provider, external_id)` tuple
    pub async fn find_by_external_id(
        &self,
        user_id: &Uuid,
        provider_slug: &str,
        external_id: &str,
    ) -> Result<Option<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::UserId.eq(*user_id))
            .filter(connection::Column::ProviderSlug.eq(provider_slug))
            .filter(connection::Column::ExternalId.eq(external_id))
            .one(&*self.db)
            .await?)
    }

    /// Connections whose access token expires within `skew_seconds`, limited
    /// to those that have a refresh token and are still considered healthy.
    pub async fn find_due_for_refresh(
        &self,
        skew_seconds: i64,
    ) -> Result<Vec<connection::Model>> {
        let horizon = Utc::now() + chrono::Duration::seconds(skew_seconds);
        let fixed: DateTimeWithTimeZone = horizon.into();

        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Connected))
            .filter(connection::Column::RefreshTokenCiphertext.is_not_null())
            .filter(connection::Column::TokenExpiresAt.lte(fixed))
            .order_by_asc(connection::Column::TokenExpiresAt)
            .all(&*self.db)
            .await?)
    }

    /// Connected connections ordered by how long ago they last synced,
    /// never-synced first. Feed for the periodic scheduler.
    pub async fn find_sync_candidates(&self, limit: u64) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::Status.eq(ConnectionStatus::Connected))
            .order_by_asc(connection::Column::LastSyncAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Updates status and expiry without touching token ciphertexts
    pub async fn update_status(
        &self,
        id: &Uuid,
        status: ConnectionStatus,
    ) -> Result<connection::Model> {
        let existing = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Connection '{}' not found", id))?;

        let mut model: connection::ActiveModel = existing.into();
        model.status = Set(status);
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Records a failed refresh attempt: bumps the failure counters and
    /// stores the computed backoff delay.
    pub async fn record_refresh_failure(
        &self,
        id: &Uuid,
        backoff_delay_seconds: i64,
        latch_error: bool,
    ) -> Result<connection::Model> {
        let existing = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Connection '{}' not found", id))?;

        let consecutive_errors = existing.consecutive_errors + 1;
        let retry_count = existing.retry_count + 1;

        let mut model: connection::ActiveModel = existing.into();
        model.consecutive_errors = Set(consecutive_errors);
        model.retry_count = Set(retry_count);
        model.backoff_delay_seconds = Set(backoff_delay_seconds);
        if latch_error {
            model.status = Set(ConnectionStatus::Error);
        }
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Clears the failure counters after a successful refresh or exchange
    pub async fn reset_refresh_state(&self, id: &Uuid) -> Result<connection::Model> {
        let existing = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Connection '{}' not found", id))?;

        let mut model: connection::ActiveModel = existing.into();
        model.consecutive_errors = Set(0);
        model.retry_count = Set(0);
        model.backoff_delay_seconds = Set(0);
        model.status = Set(ConnectionStatus::Connected);
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Revokes a connection: tokens are dropped but the row is retained so
    /// sync history stays queryable.
    pub async fn revoke(&self, user_id: &Uuid, id: &Uuid) -> Result<connection::Model> {
        let existing = self
            .find_by_id(user_id, id)
            .await?
            .ok_or_else(|| anyhow!("Connection with ID '{}' not found for user", id))?;

        let mut model: connection::ActiveModel = existing.into();
        model.status = Set(ConnectionStatus::Revoked);
        model.access_token_ciphertext = Set(None);
        model.refresh_token_ciphertext = Set(None);
        model.token_expires_at = Set(None);
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Folds a completed sync into the running health metrics
    pub async fn record_sync_outcome(
        &self,
        id: &Uuid,
        succeeded: bool,
        avg_item_ms: f64,
    ) -> Result<connection::Model> {
        let existing = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("Connection '{}' not found", id))?;

        // Exponentially weighted running averages; cheap to store and good
        // enough for the health endpoint.
        const ALPHA: f64 = 0.2;
        let outcome = if succeeded { 1.0 } else { 0.0 };
        let success_rate = existing.success_rate * (1.0 - ALPHA) + outcome * ALPHA;
        let avg_response_ms = if existing.avg_response_ms == 0.0 {
            avg_item_ms
        } else {
            existing.avg_response_ms * (1.0 - ALPHA) + avg_item_ms * ALPHA
        };

        let mut model: connection::ActiveModel = existing.into();
        model.success_rate = Set(success_rate);
        model.avg_response_ms = Set(avg_response_ms);
        if succeeded {
            model.last_sync_at = Set(Some(Utc::now().into()));
        }
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_repo() -> ConnectionRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let key = CryptoKey::new(vec![7u8; 32]).unwrap();
        ConnectionRepository::new(Arc::new(db), key)
    }

    fn new_connection(user_id: Uuid) -> connection::ActiveModel {
        let now = Utc::now();
        connection::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            provider_slug: Set("spotify".to_string()),
            external_id: Set("acct-1".to_string()),
            display_name: Set(Some("Listener".to_string())),
            status: Set(ConnectionStatus::Connected),
            access_token_ciphertext: Set(None),
            refresh_token_ciphertext: Set(None),
            token_expires_at: Set(Some(now.into())),
            scopes: Set(None),
            consecutive_errors: Set(0),
            retry_count: Set(0),
            backoff_delay_seconds: Set(0),
            last_sync_at: Set(None),
            success_rate: Set(1.0),
            avg_response_ms: Set(0.0),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
    }

    #[tokio::test]
    async fn create_with_tokens_roundtrips() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();

        let access = SecretToken::new("access-1");
        let refresh = SecretToken::new("refresh-1");
        let created = repo
            .create_with_tokens(new_connection(user_id), Some(&access), Some(&refresh))
            .await
            .unwrap();

        assert!(created.access_token_ciphertext.is_some());
        let (opened_access, opened_refresh) = repo.decrypt_tokens(&created).unwrap();
        assert_eq!(opened_access.unwrap().expose(), "access-1");
        assert_eq!(opened_refresh.unwrap().expose(), "refresh-1");
    }

    #[tokio::test]
    async fn refresh_failure_counters_and_reset() {
        let repo = test_repo().await;
        let created = repo
            .create_with_tokens(new_connection(Uuid::new_v4()), None, None)
            .await
            .unwrap();

        let after_one = repo
            .record_refresh_failure(&created.id, 2, false)
            .await
            .unwrap();
        assert_eq!(after_one.consecutive_errors, 1);
        assert_eq!(after_one.backoff_delay_seconds, 2);
        assert_eq!(after_one.status, ConnectionStatus::Connected);

        let latched = repo
            .record_refresh_failure(&created.id, 4, true)
            .await
            .unwrap();
        assert_eq!(latched.consecutive_errors, 2);
        assert_eq!(latched.status, ConnectionStatus::Error);

        let reset = repo.reset_refresh_state(&created.id).await.unwrap();
        assert_eq!(reset.consecutive_errors, 0);
        assert_eq!(reset.retry_count, 0);
        assert_eq!(reset.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn revoke_clears_tokens_but_keeps_row() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();
        let access = SecretToken::new("access");
        let created = repo
            .create_with_tokens(new_connection(user_id), Some(&access), None)
            .await
            .unwrap();

        let revoked = repo.revoke(&user_id, &created.id).await.unwrap();
        assert_eq!(revoked.status, ConnectionStatus::Revoked);
        assert!(revoked.access_token_ciphertext.is_none());

        // Row still exists for history
        assert!(repo.get_by_id(&created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn find_due_for_refresh_filters_status() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();

        let refresh = SecretToken::new("refresh");
        let due = repo
            .create_with_tokens(new_connection(user_id), None, Some(&refresh))
            .await
            .unwrap();

        // Second connection has no refresh token and must not be picked up.
        let mut other = new_connection(user_id);
        other.external_id = Set("acct-2".to_string());
        repo.create_with_tokens(other, None, None).await.unwrap();

        let found = repo.find_due_for_refresh(3600).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);

        repo.update_status(&due.id, ConnectionStatus::Error)
            .await
            .unwrap();
        assert!(repo.find_due_for_refresh(3600).await.unwrap().is_empty());
    }
}
