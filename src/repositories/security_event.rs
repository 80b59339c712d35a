//! # Security Event Repository
//!
//! Database operations for the audit trail: append-only security events and
//! the alerts raised for high-risk ones.

use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::security_alert::{self, ActiveModel as AlertActiveModel, Entity as Alert};
use crate::models::security_event::{self, ActiveModel as EventActiveModel, Entity as Event};

/// Repository for security event and alert database operations
pub struct SecurityEventRepository {
    db: Arc<DatabaseConnection>,
}

impl SecurityEventRepository {
    /// Create a new security event repository
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Append an event to the audit trail.
    pub async fn record_event(
        &self,
        user_id: Option<Uuid>,
        event_type: &str,
        risk_level: i32,
        description: &str,
        metadata: JsonValue,
        retention_days: i64,
    ) -> Result<security_event::Model, sea_orm::DbErr> {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let event = EventActiveModel {
            id: Set(id),
            user_id: Set(user_id),
            event_type: Set(event_type.to_string()),
            risk_level: Set(risk_level),
            description: Set(description.to_string()),
            metadata: Set(metadata),
            resolved: Set(false),
            retain_until: Set((now + Duration::days(retention_days)).into()),
            created_at: Set(now.into()),
        };

        event.insert(&*self.db).await?;

        Event::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| sea_orm::DbErr::RecordNotFound("security event not persisted".into()))
    }

    /// Raise an alert for a recorded event.
    pub async fn raise_alert(
        &self,
        event: &security_event::Model,
        summary: &str,
    ) -> Result<security_alert::Model, sea_orm::DbErr> {
        let id = Uuid::new_v4();

        let alert = AlertActiveModel {
            id: Set(id),
            event_id: Set(event.id),
            risk_level: Set(event.risk_level),
            summary: Set(summary.to_string()),
            acknowledged: Set(false),
            acknowledged_at: Set(None),
            created_at: Set(Utc::now().into()),
        };

        alert.insert(&*self.db).await?;

        Alert::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| sea_orm::DbErr::RecordNotFound("security alert not persisted".into()))
    }

    /// List unacknowledged alerts at or above the given risk level, newest
    /// first.
    pub async fn list_open_alerts(
        &self,
        min_risk_level: i32,
    ) -> Result<Vec<security_alert::Model>, sea_orm::DbErr> {
        Alert::find()
            .filter(security_alert::Column::Acknowledged.eq(false))
            .filter(security_alert::Column::RiskLevel.gte(min_risk_level))
            .order_by_desc(security_alert::Column::CreatedAt)
            .all(&*self.db)
            .await
    }

    /// Acknowledge an alert. Returns `None` when the alert does not exist.
    pub async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
    ) -> Result<Option<security_alert::Model>, sea_orm::DbErr> {
        let Some(alert) = Alert::find_by_id(alert_id).one(&*self.db).await? else {
            return Ok(None);
        };

        let mut active: AlertActiveModel = alert.into();
        active.acknowledged = Set(true);
        active.acknowledged_at = Set(Some(Utc::now().into()));
        Ok(Some(active.update(&*self.db).await?))
    }

    /// List recent events for a user, newest first.
    pub async fn list_events_for_user(
        &self,
        user_id: Uuid,
        limit: u64,
    ) -> Result<Vec<security_event::Model>, sea_orm::DbErr> {
        use sea_orm::QuerySelect;

        Event::find()
            .filter(security_event::Column::UserId.eq(user_id))
            .order_by_desc(security_event::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db)
            .await
    }

    /// Delete events whose retention window has lapsed, along with any alerts
    /// raised for them. Returns the number of purged events.
    pub async fn purge_expired(&self) -> Result<u64, sea_orm::DbErr> {
        let now: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();

        let expired = Event::find()
            .filter(security_event::Column::RetainUntil.lt(now))
            .all(&*self.db)
            .await?;

        if expired.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = expired.iter().map(|e| e.id).collect();

        Alert::delete_many()
            .filter(security_alert::Column::EventId.is_in(ids.clone()))
            .exec(&*self.db)
            .await?;

        let result = Event::delete_many()
            .filter(security_event::Column::Id.is_in(ids))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_repo() -> SecurityEventRepository {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        SecurityEventRepository::new(Arc::new(db))
    }

    #[tokio::test]
    async fn record_and_alert_flow() {
        let repo = test_repo().await;
        let user_id = Uuid::new_v4();

        let event = repo
            .record_event(
                Some(user_id),
                "token_refresh_failed",
                3,
                "refresh failed 5 times",
                serde_json::json!({"provider": "spotify"}),
                730,
            )
            .await
            .unwrap();
        assert_eq!(event.risk_level, 3);
        assert!(!event.resolved);

        let alert = repo.raise_alert(&event, "refresh loop latched").await.unwrap();
        assert_eq!(alert.event_id, event.id);

        let open = repo.list_open_alerts(3).await.unwrap();
        assert_eq!(open.len(), 1);

        // Below-threshold filter hides nothing; above-threshold hides it
        assert_eq!(repo.list_open_alerts(1).await.unwrap().len(), 1);
        assert!(repo.list_open_alerts(4).await.unwrap().is_empty());

        let acked = repo.acknowledge_alert(alert.id).await.unwrap().unwrap();
        assert!(acked.acknowledged);
        assert!(acked.acknowledged_at.is_some());
        assert!(repo.list_open_alerts(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_missing_alert_returns_none() {
        let repo = test_repo().await;
        assert!(
            repo.acknowledge_alert(Uuid::new_v4())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn purge_removes_lapsed_events_and_their_alerts() {
        let repo = test_repo().await;

        // Negative retention puts retain_until in the past.
        let lapsed = repo
            .record_event(None, "session_expired", 2, "old", serde_json::json!({}), -1)
            .await
            .unwrap();
        repo.raise_alert(&lapsed, "old alert").await.unwrap();

        let kept = repo
            .record_event(None, "session_expired", 2, "new", serde_json::json!({}), 730)
            .await
            .unwrap();

        let purged = repo.purge_expired().await.unwrap();
        assert_eq!(purged, 1);

        assert!(repo.list_open_alerts(1).await.unwrap().is_empty());

        // Unexpired event survives
        let remaining = Event::find_by_id(kept.id)
            .one(&*repo.db)
            .await
            .unwrap();
        assert!(remaining.is_some());
    }
}
