//! # Auth Session Model
//!
//! This module contains the auth session entity: one in-flight PKCE
//! authorization attempt for a (user, provider) pair.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Lifecycle states of an authorization session.
///
/// `Initiated` and `Authorized` are live; everything else is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[sea_orm(string_value = "initiated")]
    Initiated,
    #[sea_orm(string_value = "authorized")]
    Authorized,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "error")]
    Error,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl SessionStatus {
    /// A terminal session can never transition again and carries no verifier.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Error | Self::Cancelled)
    }
}

/// Auth session entity for in-flight OAuth authorization attempts
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "auth_sessions")]
pub struct Model {
    /// Primary key UUID
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// User that started the authorization flow
    pub user_id: Uuid,

    /// Provider slug (e.g., "spotify", "tidal")
    pub provider_slug: String,

    /// Anti-forgery state token bound to this session
    pub state: String,

    /// PKCE code verifier; cleared once the exchange step is reached
    pub code_verifier: Option<String>,

    /// Requested OAuth scopes, stored as JSON array
    pub scopes: Option<JsonValue>,

    /// Current session status
    pub status: SessionStatus,

    /// Provider error payload recorded on a failed exchange
    pub error_detail: Option<String>,

    /// Number of callback attempts made against this session
    pub attempts: i32,

    /// Absolute expiry of the flow
    pub expires_at: chrono::DateTime<chrono::Utc>,

    /// When the session was created
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// When the session was last updated
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Initiated.is_terminal());
        assert!(!SessionStatus::Authorized.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }
}
