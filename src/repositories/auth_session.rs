//! # Auth Session Repository
//!
//! Database operations for in-flight authorization sessions.

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::auth_session::{self, ActiveModel, Entity, Model, SessionStatus};

/// Repository for auth session database operations
pub struct AuthSessionRepository {
    db: Arc<DatabaseConnection>,
}

impl AuthSessionRepository {
    /// Create a new auth session repository
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Create a new session in the `initiated` state.
    pub async fn create(
        &self,
        user_id: Uuid,
        provider_slug: &str,
        state: &str,
        code_verifier: &str,
        scopes: Option<JsonValue>,
        ttl_seconds: i64,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let session = ActiveModel {
            id: Set(id),
            user_id: Set(user_id),
            provider_slug: Set(provider_slug.to_string()),
            state: Set(state.to_string()),
            code_verifier: Set(Some(code_verifier.to_string())),
            scopes: Set(scopes),
            status: Set(SessionStatus::Initiated),
            error_detail: Set(None),
            attempts: Set(0),
            expires_at: Set(now + Duration::seconds(ttl_seconds)),
            created_at: Set(now),
            updated_at: Set(now),
        };

        session.insert(&*self.db).await?;

        // Query back by ID so SQLite (no RETURNING on text PKs) behaves the
        // same as Postgres.
        Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| sea_orm::DbErr::RecordNotFound("auth session not persisted".into()))
    }

    /// Find a session by ID scoped to its owning user.
    pub async fn find_by_id(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find_by_id(session_id)
            .filter(auth_session::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
    }

    /// Find the live (non-terminal, unexpired) session for a user/provider
    /// pair, if one exists.
    pub async fn find_live(
        &self,
        user_id: Uuid,
        provider_slug: &str,
    ) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(auth_session::Column::UserId.eq(user_id))
            .filter(auth_session::Column::ProviderSlug.eq(provider_slug))
            .filter(
                auth_session::Column::Status
                    .is_in([SessionStatus::Initiated, SessionStatus::Authorized]),
            )
            .filter(auth_session::Column::ExpiresAt.gt(Utc::now()))
            .order_by_desc(auth_session::Column::CreatedAt)
            .one(&*self.db)
            .await
    }

    /// Look up a session by its anti-forgery state token. Expired rows are
    /// returned so the caller can tell "expired" apart from "unknown".
    pub async fn find_by_state(&self, state: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        Entity::find()
            .filter(auth_session::Column::State.eq(state))
            .one(&*self.db)
            .await
    }

    /// Transition a session to a new status.
    ///
    /// The code verifier is single-use: it is cleared whenever the session
    /// leaves the `initiated` state.
    pub async fn transition(
        &self,
        session: Model,
        status: SessionStatus,
        error_detail: Option<String>,
    ) -> Result<Model, sea_orm::DbErr> {
        let mut active: ActiveModel = session.into();
        if status != SessionStatus::Initiated {
            active.code_verifier = Set(None);
        }
        active.status = Set(status);
        if error_detail.is_some() {
            active.error_detail = Set(error_detail);
        }
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await
    }

    /// Record another callback attempt against a session.
    pub async fn increment_attempts(&self, session: Model) -> Result<Model, sea_orm::DbErr> {
        let attempts = session.attempts + 1;
        let mut active: ActiveModel = session.into();
        active.attempts = Set(attempts);
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await
    }

    /// Mark all overdue live sessions as expired, clearing their verifiers.
    /// Returns the sessions that were expired by this sweep.
    pub async fn sweep_expired(&self) -> Result<Vec<Model>, sea_orm::DbErr> {
        let overdue = Entity::find()
            .filter(
                auth_session::Column::Status
                    .is_in([SessionStatus::Initiated, SessionStatus::Authorized]),
            )
            .filter(auth_session::Column::ExpiresAt.lte(Utc::now()))
            .all(&*self.db)
            .await?;

        let mut expired = Vec::with_capacity(overdue.len());
        for session in overdue {
            expired.push(
                self.transition(session, SessionStatus::Expired, None)
                    .await?,
            );
        }

        Ok(expired)
    }
}
