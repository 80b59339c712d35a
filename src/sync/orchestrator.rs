//! # Sync Orchestrator
//!
//! Runs sync jobs through the fixed phase pipeline. One non-terminal job per
//! connection at a time: a higher-priority start supersedes the running job,
//! an equal-or-lower one is rejected. Pause drains in-flight work and parks
//! the job; resume re-enters the interrupted phase at its saved cursor.
//! Cancellation is cooperative, checked between batches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::{Semaphore, watch};
use tokio::time::{Duration as TokioDuration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{SecurityAuditLogger, risk};
use crate::config::AppConfig;
use crate::connection_store::ConnectionStore;
use crate::crypto::SecretToken;
use crate::error::ServiceError;
use crate::models::connection::ConnectionStatus;
use crate::models::sync_job::{self, JobStatus, SyncType};
use crate::providers::{Cursor, FetchParams, ProviderRegistry, SyncError};
use crate::repositories::SyncJobRepository;
use crate::sync::phases::{JobPhases, SyncPhaseName, collections_for};
use crate::sync::sink::ItemSink;

/// Summary handed back to the caller of `start`.
#[derive(Debug)]
pub struct StartedSync {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Cancel => "cancel",
        }
    }
}

#[derive(Debug)]
pub struct ControlOutcome {
    pub success: bool,
    pub new_status: JobStatus,
}

/// Handles held for each running worker task.
struct JobControl {
    cancel: CancellationToken,
    pause: CancellationToken,
    status_rx: watch::Receiver<JobStatus>,
}

enum Interrupt {
    Cancel,
    Pause,
}

pub struct SyncOrchestrator {
    config: Arc<AppConfig>,
    jobs: SyncJobRepository,
    store: Arc<ConnectionStore>,
    registry: Arc<ProviderRegistry>,
    sink: Arc<dyn ItemSink>,
    audit: Arc<SecurityAuditLogger>,
    controls: Mutex<HashMap<Uuid, JobControl>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        jobs: SyncJobRepository,
        store: Arc<ConnectionStore>,
        registry: Arc<ProviderRegistry>,
        sink: Arc<dyn ItemSink>,
        audit: Arc<SecurityAuditLogger>,
    ) -> Self {
        Self {
            config,
            jobs,
            store,
            registry,
            sink,
            audit,
            controls: Mutex::new(HashMap::new()),
        }
    }

    /// Start a sync job for a connection, superseding a lower-priority
    /// active job or rejecting when one of equal or higher priority runs.
    #[instrument(skip(self), fields(user_id = %user_id, connection_id = %connection_id))]
    pub async fn start(
        self: &Arc<Self>,
        user_id: Uuid,
        connection_id: Uuid,
        sync_type: SyncType,
        priority: i16,
    ) -> Result<StartedSync, ServiceError> {
        let connection = self
            .store
            .repository()
            .find_by_id(&user_id, &connection_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("connection '{}'", connection_id)))?;
        if connection.status != ConnectionStatus::Connected {
            return Err(ServiceError::ReauthorizationRequired);
        }
        self.registry.ensure_available(&connection.provider_slug)?;

        if let Some(active) = self.jobs.find_active_for_connection(connection_id).await? {
            if priority > active.priority {
                self.supersede(active, priority).await?;
            } else {
                return Err(ServiceError::SyncAlreadyRunning {
                    job_id: active.id,
                    status: active.status,
                });
            }
        }

        let running = self.controls.lock().unwrap().len() as u32;
        if running >= self.config.sync.max_concurrent_jobs {
            return Err(ServiceError::ProviderUnavailable(
                "sync worker capacity reached, retry later".into(),
            ));
        }

        let job = self
            .jobs
            .create(
                connection_id,
                user_id,
                &connection.provider_slug,
                sync_type,
                priority,
                JobPhases::plan().to_json(),
            )
            .await?;
        counter!("sync_jobs_started_total").increment(1);
        self.audit_job(&job, "started", json!({ "sync_type": sync_type, "priority": priority }))
            .await?;

        self.spawn_runner(job.id, JobStatus::Initializing);
        Ok(StartedSync {
            job_id: job.id,
            status: job.status,
            estimated_completion: None,
        })
    }

    /// Current job state, user-scoped.
    pub async fn status(
        &self,
        user_id: Uuid,
        job_id: Uuid,
    ) -> Result<sync_job::Model, ServiceError> {
        self.jobs
            .find_for_user(user_id, job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("sync job '{}'", job_id)))
    }

    /// Pause, resume or cancel a job. Pause and cancel wait for the worker
    /// to drain its in-flight batch before returning the settled status.
    #[instrument(skip(self), fields(user_id = %user_id, job_id = %job_id, action = action.as_str()))]
    pub async fn control(
        self: &Arc<Self>,
        user_id: Uuid,
        job_id: Uuid,
        action: ControlAction,
    ) -> Result<ControlOutcome, ServiceError> {
        let job = self
            .jobs
            .find_for_user(user_id, job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("sync job '{}'", job_id)))?;

        let outcome = match action {
            ControlAction::Pause => {
                if job.status != JobStatus::InProgress {
                    return Err(ServiceError::InvalidRequest(format!(
                        "cannot pause a job in status {:?}",
                        job.status
                    )));
                }
                let rx = self.signal(job_id, |c| c.pause.cancel());
                let Some(rx) = rx else {
                    return Err(ServiceError::InvalidRequest(
                        "job has no running worker".into(),
                    ));
                };
                let settled = self
                    .await_status(rx, |s| s == JobStatus::Paused || s.is_terminal())
                    .await?;
                ControlOutcome {
                    success: settled == JobStatus::Paused,
                    new_status: settled,
                }
            }
            ControlAction::Resume => {
                if job.status != JobStatus::Paused {
                    return Err(ServiceError::InvalidRequest(format!(
                        "cannot resume a job in status {:?}",
                        job.status
                    )));
                }
                let paused_for = (Utc::now() - job.updated_at.with_timezone(&Utc))
                    .num_milliseconds()
                    .max(0);
                let job = self.jobs.add_paused_ms(job, paused_for).await?;
                self.spawn_runner(job.id, JobStatus::Paused);
                ControlOutcome {
                    success: true,
                    new_status: JobStatus::InProgress,
                }
            }
            ControlAction::Cancel => {
                if job.status.is_terminal() {
                    return Err(ServiceError::InvalidRequest(format!(
                        "cannot cancel a job in status {:?}",
                        job.status
                    )));
                }
                let rx = self.signal(job_id, |c| c.cancel.cancel());
                let settled = match rx {
                    Some(rx) => self.await_status(rx, |s| s.is_terminal()).await?,
                    None => {
                        // No worker (paused job): settle the row directly.
                        let cancelled = self.jobs.transition(job, JobStatus::Cancelled).await?;
                        counter!("sync_jobs_cancelled_total").increment(1);
                        cancelled.status
                    }
                };
                ControlOutcome {
                    success: settled == JobStatus::Cancelled,
                    new_status: settled,
                }
            }
        };

        if let Some(job) = self.jobs.get_by_id(job_id).await? {
            let entry = json!({
                "action": action.as_str(),
                "at": Utc::now(),
                "resulting_status": outcome.new_status,
            });
            let job = self.jobs.append_control(job, entry).await?;
            self.audit_job(&job, action.as_str(), json!({ "new_status": outcome.new_status }))
                .await?;
        }
        Ok(outcome)
    }

    fn signal<F>(&self, job_id: Uuid, f: F) -> Option<watch::Receiver<JobStatus>>
    where
        F: FnOnce(&JobControl),
    {
        let controls = self.controls.lock().unwrap();
        controls.get(&job_id).map(|control| {
            f(control);
            control.status_rx.clone()
        })
    }

    async fn await_status<F>(
        &self,
        mut rx: watch::Receiver<JobStatus>,
        done: F,
    ) -> Result<JobStatus, ServiceError>
    where
        F: Fn(JobStatus) -> bool,
    {
        let drain_limit = TokioDuration::from_secs(self.config.sync.phase_stall_timeout_seconds);
        timeout(drain_limit, async {
            loop {
                let status = *rx.borrow();
                if done(status) {
                    return status;
                }
                if rx.changed().await.is_err() {
                    return *rx.borrow();
                }
            }
        })
        .await
        .map_err(|_| ServiceError::PhaseTimeout("control drain".into()))
    }

    /// Mark a running job superseded and stop its worker.
    async fn supersede(&self, job: sync_job::Model, new_priority: i16) -> Result<(), ServiceError> {
        info!(job_id = %job.id, old_priority = job.priority, new_priority, "superseding active sync job");
        let job = self.jobs.transition(job, JobStatus::Superseded).await?;
        if let Some(control) = self.controls.lock().unwrap().remove(&job.id) {
            control.cancel.cancel();
        }
        counter!("sync_jobs_superseded_total").increment(1);
        self.audit_job(&job, "superseded", json!({ "new_priority": new_priority }))
            .await?;
        Ok(())
    }

    fn spawn_runner(self: &Arc<Self>, job_id: Uuid, initial_status: JobStatus) {
        let cancel = CancellationToken::new();
        let pause = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(initial_status);
        self.controls.lock().unwrap().insert(
            job_id,
            JobControl {
                cancel: cancel.clone(),
                pause: pause.clone(),
                status_rx,
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.run_job(job_id, cancel, pause, &status_tx).await;
            this.controls.lock().unwrap().remove(&job_id);
        });
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn run_job(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
        pause: CancellationToken,
        status_tx: &watch::Sender<JobStatus>,
    ) {
        match self.drive(job_id, &cancel, &pause, status_tx).await {
            Ok(final_status) => {
                debug!(status = ?final_status, "sync worker settled");
            }
            Err(err) => {
                if let Err(persist_err) = self.fail_job(job_id, &err, status_tx).await {
                    error!(error = ?persist_err, "failed to persist sync job failure");
                }
            }
        }
    }

    async fn drive(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
        pause: &CancellationToken,
        status_tx: &watch::Sender<JobStatus>,
    ) -> Result<JobStatus, ServiceError> {
        let mut job = self
            .jobs
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("sync job '{}'", job_id)))?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        let mut phases = JobPhases::from_json(&job.phases).unwrap_or_else(JobPhases::plan);
        job = self.jobs.transition(job, JobStatus::InProgress).await?;
        let _ = status_tx.send(JobStatus::InProgress);

        let mut token: Option<SecretToken> = None;
        loop {
            if let Some(interrupt) = interruption(cancel, pause) {
                let settled = self.settle_interrupt(job, &phases, interrupt, status_tx).await?;
                return Ok(settled);
            }
            let Some(phase_name) = phases.current() else {
                break;
            };
            debug!(phase = %phase_name, "entering sync phase");
            match phase_name {
                SyncPhaseName::Initialization => {
                    self.run_initialization(&job, &mut phases).await?;
                }
                SyncPhaseName::Authentication => {
                    let access = self.store.get_valid_token(job.connection_id).await?;
                    token = Some(access);
                    let phase = expect_phase(&mut phases, SyncPhaseName::Authentication)?;
                    phase.processed_items = 1;
                    phase.completed = true;
                }
                SyncPhaseName::DataFetch => {
                    let access = token
                        .clone()
                        .ok_or_else(|| internal("data fetch reached without a token"))?;
                    self.run_data_fetch(&mut job, &mut phases, access, cancel, pause)
                        .await?;
                }
                SyncPhaseName::Processing => {
                    self.run_processing(&mut job, &mut phases, cancel, pause)
                        .await?;
                }
                SyncPhaseName::Finalization => {
                    self.run_finalization(&job, &mut phases).await?;
                }
            }
            job = self.save_progress(job, &phases).await?;
        }

        let job = self.jobs.transition(job, JobStatus::Completed).await?;
        let _ = status_tx.send(JobStatus::Completed);
        counter!("sync_jobs_completed_total").increment(1);
        if let Some(started) = job.started_at {
            let duration = Utc::now() - started.with_timezone(&Utc);
            histogram!("sync_job_duration_ms").record(duration.num_milliseconds() as f64);
        }
        self.audit_job(
            &job,
            "completed",
            json!({
                "processed_items": phases.total_processed(),
                "overall_progress": job.overall_progress,
            }),
        )
        .await?;
        info!(processed = phases.total_processed(), "sync job completed");
        Ok(JobStatus::Completed)
    }

    async fn run_initialization(
        &self,
        job: &sync_job::Model,
        phases: &mut JobPhases,
    ) -> Result<(), ServiceError> {
        let connection = self
            .store
            .repository()
            .get_by_id(&job.connection_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("connection '{}'", job.connection_id))
            })?;
        if connection.status != ConnectionStatus::Connected {
            return Err(ServiceError::ReauthorizationRequired);
        }
        self.registry.get(&job.provider_slug)?;

        let phase = expect_phase(phases, SyncPhaseName::Initialization)?;
        phase.processed_items = 1;
        phase.completed = true;
        Ok(())
    }

    /// Stream pages from the provider, staging item ids for processing. The
    /// cursor records which collection and page the phase is on so a resumed
    /// job continues where it stopped.
    async fn run_data_fetch(
        &self,
        job: &mut sync_job::Model,
        phases: &mut JobPhases,
        access: SecretToken,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let provider = self.registry.get(&job.provider_slug)?;
        let collections = collections_for(job.sync_type);
        let batch_size = self.config.sync.batch_size;
        let call_deadline =
            TokioDuration::from_secs(self.config.sync.phase_stall_timeout_seconds);

        let (start_collection, mut provider_cursor) = {
            let phase = expect_phase(phases, SyncPhaseName::DataFetch)?;
            restore_fetch_cursor(phase.cursor.as_ref())
        };

        for (index, collection) in collections.iter().enumerate().skip(start_collection) {
            let mut estimated_seen = false;
            loop {
                if interruption(cancel, pause).is_some() {
                    return Ok(());
                }

                let params = FetchParams {
                    access_token: access.clone(),
                    collection: collection.to_string(),
                    cursor: provider_cursor.clone().map(Cursor::from_json),
                    limit: batch_size,
                };
                let page = match timeout(call_deadline, provider.fetch_page(params)).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(ServiceError::PhaseTimeout(format!(
                            "data_fetch stalled on collection '{}'",
                            collection
                        )));
                    }
                };
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        let sync_err = SyncError::from(err);
                        return Err(fetch_failure(collection, sync_err));
                    }
                };

                let mut issues = Vec::new();
                {
                    let phase = expect_phase(phases, SyncPhaseName::DataFetch)?;
                    if !estimated_seen && let Some(total) = page.estimated_total {
                        phase.estimated_items = phase.estimated_items.saturating_add(total);
                        estimated_seen = true;
                    }
                    for item in &page.items {
                        match self.sink.ingest(job.connection_id, collection, item).await {
                            Ok(()) => {
                                phases.staged.push(item.external_id.clone());
                                let phase =
                                    expect_phase(phases, SyncPhaseName::DataFetch)?;
                                phase.processed_items += 1;
                            }
                            Err(err) => {
                                let phase =
                                    expect_phase(phases, SyncPhaseName::DataFetch)?;
                                phase.failed_items += 1;
                                phase.skipped_items += 1;
                                issues.push(json!({
                                    "phase": "data_fetch",
                                    "collection": collection,
                                    "item": item.external_id,
                                    "error": err.to_string(),
                                }));
                            }
                        }
                    }
                    counter!("sync_items_fetched_total").increment(page.items.len() as u64);
                }

                provider_cursor = page.next_cursor.as_ref().map(|c| c.as_json().clone());
                let phase = expect_phase(phases, SyncPhaseName::DataFetch)?;
                phase.cursor = Some(json!({
                    "collection": index,
                    "cursor": provider_cursor,
                }));
                if !issues.is_empty() {
                    *job = self.jobs.append_issues(job.clone(), issues, vec![]).await?;
                }
                *job = self.save_progress(job.clone(), phases).await?;

                if !page.has_more {
                    provider_cursor = None;
                    break;
                }
            }
            // Next collection starts from a clean cursor.
            let phase = expect_phase(phases, SyncPhaseName::DataFetch)?;
            phase.cursor = Some(json!({ "collection": index + 1, "cursor": JsonValue::Null }));
        }

        let staged_total = phases.staged.len() as u64;
        let phase = expect_phase(phases, SyncPhaseName::DataFetch)?;
        phase.estimated_items = phase.estimated_items.max(phase.settled_items());
        phase.completed = true;
        let processing = expect_phase(phases, SyncPhaseName::Processing)?;
        processing.estimated_items = staged_total.max(1);
        Ok(())
    }

    /// Work through the staged items in batches with bounded concurrency.
    /// The cursor is the index of the next unprocessed item.
    async fn run_processing(
        &self,
        job: &mut sync_job::Model,
        phases: &mut JobPhases,
        cancel: &CancellationToken,
        pause: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let staged = phases.staged.clone();
        let batch_size = self.config.sync.batch_size as usize;
        let retry_limit = self.config.sync.item_retry_limit;
        let call_deadline =
            TokioDuration::from_secs(self.config.sync.phase_stall_timeout_seconds);
        let semaphore = Arc::new(Semaphore::new(self.config.sync.item_concurrency as usize));

        let mut index = {
            let phase = expect_phase(phases, SyncPhaseName::Processing)?;
            phase
                .cursor
                .as_ref()
                .and_then(|c| c.get("index"))
                .and_then(JsonValue::as_u64)
                .unwrap_or(0) as usize
        };

        while index < staged.len() {
            if interruption(cancel, pause).is_some() {
                return Ok(());
            }

            let end = (index + batch_size.max(1)).min(staged.len());
            let mut handles = Vec::with_capacity(end - index);
            for external_id in &staged[index..end] {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| internal("item semaphore closed"))?;
                let sink = self.sink.clone();
                let connection_id = job.connection_id;
                let external_id = external_id.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let mut attempt = 0u32;
                    let outcome = loop {
                        attempt += 1;
                        let result =
                            timeout(call_deadline, sink.process(connection_id, &external_id))
                                .await;
                        match result {
                            Err(_) => break Err(SyncError::transient("item processing stalled")),
                            Ok(Ok(())) => break Ok(()),
                            Ok(Err(err)) if err.is_retryable() && attempt < retry_limit => {
                                sleep(TokioDuration::from_millis(50 * attempt as u64)).await;
                            }
                            Ok(Err(err)) => break Err(err),
                        }
                    };
                    (external_id, outcome)
                }));
            }

            let mut errors = Vec::new();
            for handle in handles {
                let phase = expect_phase(phases, SyncPhaseName::Processing)?;
                match handle.await {
                    Ok((_, Ok(()))) => {
                        phase.processed_items += 1;
                        counter!("sync_items_processed_total").increment(1);
                    }
                    Ok((external_id, Err(err))) => {
                        phase.failed_items += 1;
                        phase.skipped_items += 1;
                        counter!("sync_items_failed_total").increment(1);
                        errors.push(json!({
                            "phase": "processing",
                            "item": external_id,
                            "error": err.to_string(),
                        }));
                    }
                    Err(join_err) => {
                        phase.failed_items += 1;
                        phase.skipped_items += 1;
                        counter!("sync_items_failed_total").increment(1);
                        errors.push(json!({
                            "phase": "processing",
                            "error": join_err.to_string(),
                        }));
                    }
                }
            }

            index = end;
            let phase = expect_phase(phases, SyncPhaseName::Processing)?;
            phase.cursor = Some(json!({ "index": index }));
            if !errors.is_empty() {
                *job = self.jobs.append_issues(job.clone(), errors, vec![]).await?;
            }
            *job = self.save_progress(job.clone(), phases).await?;
        }

        let phase = expect_phase(phases, SyncPhaseName::Processing)?;
        phase.completed = true;
        Ok(())
    }

    async fn run_finalization(
        &self,
        job: &sync_job::Model,
        phases: &mut JobPhases,
    ) -> Result<(), ServiceError> {
        let settled: u64 = phases.phases.iter().map(|p| p.settled_items()).sum();
        let avg_item_ms = match job.started_at {
            Some(started) => {
                let active_ms = (Utc::now() - started.with_timezone(&Utc)).num_milliseconds()
                    - job.paused_ms;
                active_ms.max(0) as f64 / settled.max(1) as f64
            }
            None => 0.0,
        };
        self.store
            .record_sync_outcome(job.connection_id, true, avg_item_ms)
            .await?;

        let phase = expect_phase(phases, SyncPhaseName::Finalization)?;
        phase.processed_items = 1;
        phase.completed = true;
        Ok(())
    }

    async fn settle_interrupt(
        &self,
        job: sync_job::Model,
        phases: &JobPhases,
        interrupt: Interrupt,
        status_tx: &watch::Sender<JobStatus>,
    ) -> Result<JobStatus, ServiceError> {
        let job = self.save_progress(job, phases).await?;
        match interrupt {
            Interrupt::Cancel => {
                // A superseding start settles the row itself; do not overwrite.
                let fresh = self.jobs.get_by_id(job.id).await?;
                if let Some(fresh) = fresh
                    && fresh.status.is_terminal()
                {
                    let _ = status_tx.send(fresh.status);
                    return Ok(fresh.status);
                }
                let job = self.jobs.transition(job, JobStatus::Cancelled).await?;
                let _ = status_tx.send(JobStatus::Cancelled);
                counter!("sync_jobs_cancelled_total").increment(1);
                info!("sync job cancelled");
                Ok(job.status)
            }
            Interrupt::Pause => {
                let job = self.jobs.transition(job, JobStatus::Paused).await?;
                let _ = status_tx.send(JobStatus::Paused);
                counter!("sync_jobs_paused_total").increment(1);
                info!("sync job paused");
                Ok(job.status)
            }
        }
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        err: &ServiceError,
        status_tx: &watch::Sender<JobStatus>,
    ) -> Result<(), ServiceError> {
        warn!(error = %err, "sync job failed");
        let Some(job) = self.jobs.get_by_id(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        let entry = json!({
            "phase": job.current_phase,
            "error": err.to_string(),
            "code": err.code(),
            "at": Utc::now(),
        });
        let job = self.jobs.append_issues(job, vec![entry], vec![]).await?;
        let job = self.jobs.transition(job, JobStatus::Failed).await?;
        let _ = status_tx.send(JobStatus::Failed);
        counter!("sync_jobs_failed_total").increment(1);
        if let Err(record_err) = self
            .store
            .record_sync_outcome(job.connection_id, false, 0.0)
            .await
        {
            warn!(error = ?record_err, "failed to record sync outcome");
        }
        let level = match err {
            ServiceError::PhaseTimeout(_) => risk::HIGH,
            _ => risk::LOW,
        };
        self.audit
            .record(
                Some(job.user_id),
                "sync_job_failed",
                level,
                "sync job failed",
                json!({
                    "job_id": job.id,
                    "provider": job.provider_slug,
                    "error": err.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn save_progress(
        &self,
        job: sync_job::Model,
        phases: &JobPhases,
    ) -> Result<sync_job::Model, ServiceError> {
        let progress = phases.overall_progress();
        let eta = estimate_completion(
            job.started_at.map(|t| t.with_timezone(&Utc)),
            job.paused_ms,
            progress,
        );
        let current = phases.current().map(|p| p.to_string());
        let job = self
            .jobs
            .save_progress(job, phases.to_json(), current, progress, eta)
            .await?;
        Ok(job)
    }

    async fn audit_job(
        &self,
        job: &sync_job::Model,
        transition: &str,
        mut metadata: JsonValue,
    ) -> Result<(), ServiceError> {
        if let Some(object) = metadata.as_object_mut() {
            object.insert("job_id".to_string(), json!(job.id));
            object.insert("provider".to_string(), json!(job.provider_slug));
        }
        self.audit
            .record(
                Some(job.user_id),
                &format!("sync_job_{}", transition),
                risk::INFO,
                "sync job transition",
                metadata,
            )
            .await?;
        Ok(())
    }
}

fn interruption(cancel: &CancellationToken, pause: &CancellationToken) -> Option<Interrupt> {
    if cancel.is_cancelled() {
        Some(Interrupt::Cancel)
    } else if pause.is_cancelled() {
        Some(Interrupt::Pause)
    } else {
        None
    }
}

fn expect_phase(
    phases: &mut JobPhases,
    name: SyncPhaseName,
) -> Result<&mut crate::sync::phases::PhaseState, ServiceError> {
    phases
        .phase_mut(name)
        .ok_or_else(|| internal("phase pipeline is missing a stage"))
}

fn internal(message: &str) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!(message.to_string()))
}

fn fetch_failure(collection: &str, err: SyncError) -> ServiceError {
    use crate::providers::SyncErrorKind;
    match err.kind {
        SyncErrorKind::Unauthorized => ServiceError::ReauthorizationRequired,
        SyncErrorKind::RateLimited { .. } | SyncErrorKind::Transient => ServiceError::NetworkTimeout,
        SyncErrorKind::Permanent => ServiceError::Internal(anyhow::anyhow!(
            "fetch of collection '{}' failed: {}",
            collection,
            err
        )),
    }
}

fn restore_fetch_cursor(cursor: Option<&JsonValue>) -> (usize, Option<JsonValue>) {
    let Some(cursor) = cursor else {
        return (0, None);
    };
    let collection = cursor
        .get("collection")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0) as usize;
    let provider_cursor = cursor.get("cursor").filter(|c| !c.is_null()).cloned();
    (collection, provider_cursor)
}

fn estimate_completion(
    started_at: Option<DateTime<Utc>>,
    paused_ms: i64,
    progress: f64,
) -> Option<DateTime<Utc>> {
    let started = started_at?;
    if !(0.01..1.0).contains(&progress) {
        return None;
    }
    let elapsed_ms = (Utc::now() - started).num_milliseconds() - paused_ms;
    if elapsed_ms <= 0 {
        return None;
    }
    let remaining_ms = (elapsed_ms as f64 / progress) - elapsed_ms as f64;
    Some(Utc::now() + chrono::Duration::milliseconds(remaining_ms as i64))
}
