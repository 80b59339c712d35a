//! # Security Audit Logger
//!
//! Pure sink for risk-scored security events. Every state transition and
//! token operation in the service lands here; events above the configured
//! risk threshold additionally raise an alert that an operator must
//! acknowledge. A background task purges events past their retention expiry.

use std::sync::Arc;

use metrics::counter;
use sea_orm::DatabaseConnection;
use serde_json::Value as JsonValue;
use tokio::time::{Duration as TokioDuration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::models::{security_alert, security_event};
use crate::repositories::SecurityEventRepository;

/// Risk levels on the 1 (info) to 4 (critical) scale.
pub mod risk {
    pub const INFO: i32 = 1;
    pub const LOW: i32 = 2;
    pub const HIGH: i32 = 3;
    pub const CRITICAL: i32 = 4;
}

/// Append-only audit sink with threshold-based alerting.
pub struct SecurityAuditLogger {
    events: SecurityEventRepository,
    alert_risk_threshold: i32,
    retention_days: i64,
    purge_tick_seconds: u64,
}

impl SecurityAuditLogger {
    pub fn new(db: Arc<DatabaseConnection>, config: &AuditConfig) -> Self {
        Self {
            events: SecurityEventRepository::new(db),
            alert_risk_threshold: i32::from(config.alert_risk_threshold),
            retention_days: i64::from(config.retention_days),
            purge_tick_seconds: config.purge_tick_seconds,
        }
    }

    /// Append one event. When the risk level reaches the alert threshold an
    /// alert is raised as well. Risk levels are clamped to the 1..=4 scale.
    pub async fn record(
        &self,
        user_id: Option<Uuid>,
        event_type: &str,
        risk_level: i32,
        description: &str,
        metadata: JsonValue,
    ) -> Result<security_event::Model, sea_orm::DbErr> {
        let risk_level = risk_level.clamp(risk::INFO, risk::CRITICAL);
        let event = self
            .events
            .record_event(
                user_id,
                event_type,
                risk_level,
                description,
                metadata,
                self.retention_days,
            )
            .await?;
        counter!("security_events_total").increment(1);

        if risk_level >= self.alert_risk_threshold {
            warn!(
                event_type = %event_type,
                risk_level,
                "high-risk security event, raising alert"
            );
            self.events.raise_alert(&event, description).await?;
            counter!("security_alerts_raised_total").increment(1);
        }
        Ok(event)
    }

    /// Unacknowledged alerts at or above the given risk level, newest first.
    pub async fn list_unresolved(
        &self,
        min_risk_level: i32,
    ) -> Result<Vec<security_alert::Model>, sea_orm::DbErr> {
        self.events.list_open_alerts(min_risk_level).await
    }

    /// Acknowledge an alert. Returns `None` when the alert does not exist.
    pub async fn acknowledge(
        &self,
        alert_id: Uuid,
    ) -> Result<Option<security_alert::Model>, sea_orm::DbErr> {
        self.events.acknowledge_alert(alert_id).await
    }

    /// Recent events recorded for one user, newest first.
    pub async fn list_events_for_user(
        &self,
        user_id: Uuid,
        limit: u64,
    ) -> Result<Vec<security_event::Model>, sea_orm::DbErr> {
        self.events.list_events_for_user(user_id, limit).await
    }

    /// Delete events past their retention expiry along with their alerts.
    pub async fn purge_expired(&self) -> Result<u64, sea_orm::DbErr> {
        let purged = self.events.purge_expired().await?;
        if purged > 0 {
            info!(purged, "purged expired security events");
            counter!("security_events_purged_total").increment(purged);
        }
        Ok(purged)
    }

    /// Run the retention purge loop until the shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run_purge(&self, shutdown: CancellationToken) {
        info!("Starting security event purge service");
        let tick_interval = TokioDuration::from_secs(self.purge_tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Security event purge service shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    if let Err(err) = self.purge_expired().await {
                        error!(error = ?err, "Security event purge tick failed");
                    }
                }
            }
        }

        info!("Security event purge service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn logger_with_threshold(threshold: u8) -> SecurityAuditLogger {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let config = AuditConfig {
            alert_risk_threshold: threshold,
            ..AuditConfig::default()
        };
        SecurityAuditLogger::new(Arc::new(db), &config)
    }

    #[tokio::test]
    async fn events_below_threshold_do_not_alert() {
        let logger = logger_with_threshold(3).await;
        let user = Uuid::new_v4();

        logger
            .record(
                Some(user),
                "oauth_session_initiated",
                risk::INFO,
                "authorization flow started",
                json!({ "provider": "spotify" }),
            )
            .await
            .unwrap();

        assert!(logger.list_unresolved(risk::INFO).await.unwrap().is_empty());
        assert_eq!(logger.list_events_for_user(user, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn threshold_events_raise_acknowledgeable_alerts() {
        let logger = logger_with_threshold(3).await;

        let event = logger
            .record(
                None,
                "token_refresh_suppressed",
                risk::HIGH,
                "five consecutive refresh failures",
                json!({ "provider": "spotify" }),
            )
            .await
            .unwrap();

        let alerts = logger.list_unresolved(risk::HIGH).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_id, event.id);

        let acknowledged = logger.acknowledge(alerts[0].id).await.unwrap().unwrap();
        assert!(acknowledged.acknowledged);
        assert!(logger.list_unresolved(risk::INFO).await.unwrap().is_empty());

        // Unknown alert ids are reported as absent, not as errors.
        assert!(logger.acknowledge(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn risk_levels_are_clamped_to_scale() {
        let logger = logger_with_threshold(3).await;

        let event = logger
            .record(None, "weird_event", 9, "out of range", json!({}))
            .await
            .unwrap();
        assert_eq!(event.risk_level, risk::CRITICAL);

        let event = logger
            .record(None, "weird_event", -2, "out of range", json!({}))
            .await
            .unwrap();
        assert_eq!(event.risk_level, risk::INFO);
    }
}
