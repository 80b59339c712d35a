//! # Sync Scheduler
//!
//! Background task that walks connected accounts on a timer and enqueues
//! incremental sync jobs through the orchestrator. Intervals carry a random
//! jitter so a fleet of connections created together does not sync in
//! lockstep. The orchestrator's one-job-per-connection rule makes a tick
//! that races a manual sync harmless.

use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{AppConfig, SchedulerConfig};
use crate::connection_store::ConnectionStore;
use crate::error::ServiceError;
use crate::models::connection;
use crate::models::sync_job::SyncType;
use crate::providers::ProviderRegistry;
use crate::sync::SyncOrchestrator;

/// Connections evaluated per tick.
const CANDIDATE_BATCH: u64 = 128;

/// Priority used for scheduler-enqueued jobs; manual syncs default higher.
const SCHEDULED_PRIORITY: i16 = 0;

pub struct SyncScheduler {
    config: Arc<AppConfig>,
    store: Arc<ConnectionStore>,
    registry: Arc<ProviderRegistry>,
    orchestrator: Arc<SyncOrchestrator>,
}

#[derive(Debug, Default)]
struct TickStats {
    connections_polled: u64,
    jobs_enqueued: u64,
    skipped_not_due: u64,
    skipped_running: u64,
    skipped_provider: u64,
    errors: u64,
}

impl SyncScheduler {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<ConnectionStore>,
        registry: Arc<ProviderRegistry>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            orchestrator,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.scheduler.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = ?err, "Scheduler tick failed");
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    pub async fn tick(&self) -> Result<TickSummary, ServiceError> {
        let mut stats = TickStats::default();
        let candidates = self
            .store
            .repository()
            .find_sync_candidates(CANDIDATE_BATCH)
            .await?;

        for candidate in candidates {
            stats.connections_polled += 1;
            if let Err(err) = self.evaluate(&candidate, &mut stats).await {
                stats.errors += 1;
                error!(
                    error = ?err,
                    connection_id = %candidate.id,
                    "Failed to evaluate connection for scheduling"
                );
            }
        }

        gauge!("sync_scheduler_enqueued_gauge").set(stats.jobs_enqueued as f64);
        debug!(
            polled = stats.connections_polled,
            enqueued = stats.jobs_enqueued,
            skipped_not_due = stats.skipped_not_due,
            skipped_running = stats.skipped_running,
            skipped_provider = stats.skipped_provider,
            errors = stats.errors,
            "Scheduler tick completed"
        );
        Ok(TickSummary {
            enqueued: stats.jobs_enqueued,
        })
    }

    async fn evaluate(
        &self,
        candidate: &connection::Model,
        stats: &mut TickStats,
    ) -> Result<(), ServiceError> {
        let descriptor_ok = self
            .registry
            .descriptor(&candidate.provider_slug)
            .map(|d| d.accepts_new_work())
            .unwrap_or(false);
        // Unknown slugs come from stale config edits; treat as unavailable.
        if !descriptor_ok {
            stats.skipped_provider += 1;
            return Ok(());
        }

        if !is_due(candidate, &self.config.scheduler) {
            stats.skipped_not_due += 1;
            return Ok(());
        }

        match self
            .orchestrator
            .start(
                candidate.user_id,
                candidate.id,
                SyncType::Incremental,
                SCHEDULED_PRIORITY,
            )
            .await
        {
            Ok(started) => {
                stats.jobs_enqueued += 1;
                counter!("sync_scheduler_jobs_enqueued_total").increment(1);
                debug!(
                    connection_id = %candidate.id,
                    job_id = %started.job_id,
                    "Scheduled incremental sync"
                );
                Ok(())
            }
            Err(ServiceError::SyncAlreadyRunning { job_id, .. }) => {
                stats.skipped_running += 1;
                debug!(
                    connection_id = %candidate.id,
                    job_id = %job_id,
                    "Skipping scheduling; a job is already active"
                );
                Ok(())
            }
            Err(ServiceError::ReauthorizationRequired) => {
                // The connection degraded between the candidate query and
                // the start call; the refresh loop owns that follow-up.
                stats.skipped_provider += 1;
                Ok(())
            }
            Err(ServiceError::ProviderUnavailable(reason)) => {
                warn!(reason = %reason, "Scheduler backing off; sync capacity reached");
                stats.skipped_provider += 1;
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}

#[derive(Debug)]
pub struct TickSummary {
    pub enqueued: u64,
}

/// A connection is due when its jittered interval has elapsed since the
/// last completed sync; never-synced connections are due immediately.
fn is_due(candidate: &connection::Model, config: &SchedulerConfig) -> bool {
    let Some(last_sync) = candidate.last_sync_at else {
        return true;
    };
    let interval = jittered_interval_seconds(config);
    Utc::now() >= last_sync.with_timezone(&Utc) + Duration::seconds(interval)
}

fn jittered_interval_seconds(config: &SchedulerConfig) -> i64 {
    let base = config.default_interval_seconds as f64;
    let (lo, hi) = (
        config.jitter_pct_min.min(config.jitter_pct_max),
        config.jitter_pct_max.max(config.jitter_pct_min),
    );
    let pct = if (hi - lo).abs() < f64::EPSILON {
        lo
    } else {
        rand::thread_rng().gen_range(lo..hi)
    };
    (base * (1.0 + pct / 100.0)).max(0.0) as i64
}
