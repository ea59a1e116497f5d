//! Process-wide scheduled job runner.
//!
//! Every job (sync, real-time sync, learning, milestones, reconciliation)
//! runs on its own cron expression. A job whose previous execution is still
//! running skips the tick and counts the skip. Manual triggers go through
//! the same execution path, so they share the overlap protection and the
//! service objects (and with them the per-account sync guards).

use crate::learning::LearningScheduler;
use crate::monitoring::SyncMetrics;
use crate::notifications::MilestoneGate;
use crate::sync::SyncOrchestrator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub enabled: bool,
    pub sync_cron: String,
    /// `None` disables the real-time subset job.
    pub realtime_sync_cron: Option<String>,
    pub learning_cron: String,
    pub milestone_cron: String,
    pub reconciliation_cron: Option<String>,
    /// Upper bound on a single job execution.
    pub max_run_duration_minutes: u64,
    pub run_sync_on_startup: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // Every five minutes
            sync_cron: "0 */5 * * * *".to_string(),
            realtime_sync_cron: Some("30 * * * * *".to_string()),
            // Mondays at 03:00 UTC
            learning_cron: "0 0 3 * * Mon".to_string(),
            milestone_cron: "0 15 * * * *".to_string(),
            reconciliation_cron: Some("0 30 4 * * *".to_string()),
            max_run_duration_minutes: 60,
            run_sync_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    RealtimeSync,
    Learning,
    Milestones,
    Reconciliation,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::RealtimeSync => "realtime_sync",
            JobKind::Learning => "learning",
            JobKind::Milestones => "milestones",
            JobKind::Reconciliation => "reconciliation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunResult {
    pub run_id: Uuid,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// The job's own report, as JSON.
    pub report: Option<serde_json::Value>,
    pub errors: Vec<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    /// Ticks skipped because the previous run was still executing.
    pub skipped_runs: u64,
    pub avg_duration_seconds: f64,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub last_failed_run: Option<DateTime<Utc>>,
}

/// Service objects the jobs drive.
pub struct JobServices {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub learning: Arc<LearningScheduler>,
    pub milestones: Arc<MilestoneGate>,
}

#[derive(Clone)]
struct RunContext {
    services: Arc<JobServices>,
    running: Arc<Mutex<HashSet<JobKind>>>,
    statistics: Arc<RwLock<HashMap<JobKind, JobStatistics>>>,
    metrics: Option<Arc<SyncMetrics>>,
    max_duration: std::time::Duration,
}

pub struct JobRunner {
    scheduler: Arc<Mutex<JobScheduler>>,
    config: JobsConfig,
    context: RunContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl JobRunner {
    pub async fn new(
        config: JobsConfig,
        services: Arc<JobServices>,
        metrics: Option<Arc<SyncMetrics>>,
    ) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize job scheduler: {}", e))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let context = RunContext {
            services,
            running: Arc::new(Mutex::new(HashSet::new())),
            statistics: Arc::new(RwLock::new(HashMap::new())),
            metrics,
            max_duration: std::time::Duration::from_secs(config.max_run_duration_minutes * 60),
        };

        Ok(Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            config,
            context,
            shutdown_tx,
        })
    }

    /// Registers every configured job and starts the cron engine.
    #[instrument(skip(self), fields(enabled = %self.config.enabled))]
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.config.enabled {
            info!("Job runner is disabled in configuration, not starting");
            return Ok(());
        }

        let mut schedule = vec![
            (JobKind::Sync, self.config.sync_cron.clone()),
            (JobKind::Learning, self.config.learning_cron.clone()),
            (JobKind::Milestones, self.config.milestone_cron.clone()),
        ];
        if let Some(cron) = &self.config.realtime_sync_cron {
            schedule.push((JobKind::RealtimeSync, cron.clone()));
        }
        if let Some(cron) = &self.config.reconciliation_cron {
            schedule.push((JobKind::Reconciliation, cron.clone()));
        }

        for (kind, cron) in schedule {
            self.add_job(kind, &cron).await?;
        }

        {
            let sched = self.scheduler.lock().await;
            sched
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {}", e))?;
        }
        info!("⏰ Job runner started");

        if self.config.run_sync_on_startup {
            info!("Running initial sync on startup");
            if let Err(e) = self.trigger(JobKind::Sync).await {
                warn!("Startup sync did not run: {}", e);
            }
        }
        Ok(())
    }

    async fn add_job(&self, kind: JobKind, cron: &str) -> anyhow::Result<()> {
        let context = self.context.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let job = Job::new_async(cron, move |_uuid, mut _l| {
            let context = context.clone();
            let mut shutdown_rx = shutdown_rx.resubscribe();

            Box::pin(async move {
                if shutdown_rx.try_recv().is_ok() {
                    debug!(job = %kind, "Shutdown signal received, skipping scheduled run");
                    return;
                }
                match Self::execute(&context, kind).await {
                    Some(result) => info!(
                        job = %kind,
                        run_id = %result.run_id,
                        success = result.success,
                        duration_seconds = result.duration_seconds,
                        "Completed scheduled job run"
                    ),
                    None => warn!(job = %kind, "Previous run still executing, skipping this tick"),
                }
            })
        })
        .map_err(|e| anyhow::anyhow!("Invalid cron expression for {} job '{}': {}", kind, cron, e))?;

        let job_id = {
            let sched = self.scheduler.lock().await;
            sched
                .add(job)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to add {} job: {}", kind, e))?
        };
        info!(job = %kind, %job_id, cron, "Scheduled job registered");
        Ok(())
    }

    /// Runs a job now. Fails if the same job is already executing.
    #[instrument(skip(self))]
    pub async fn trigger(&self, kind: JobKind) -> anyhow::Result<JobRunResult> {
        info!(job = %kind, "Triggering manual job run");
        Self::execute(&self.context, kind)
            .await
            .ok_or_else(|| anyhow::anyhow!("{} job is already running", kind))
    }

    /// Returns `None` when the job was already running.
    async fn execute(context: &RunContext, kind: JobKind) -> Option<JobRunResult> {
        if !context.running.lock().await.insert(kind) {
            context
                .statistics
                .write()
                .await
                .entry(kind)
                .or_default()
                .skipped_runs += 1;
            if let Some(metrics) = &context.metrics {
                metrics
                    .job_ticks_skipped_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
            }
            return None;
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut errors = Vec::new();

        let outcome =
            match tokio::time::timeout(context.max_duration, Self::perform(context, kind))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!(
                    "{} job timed out after {}s",
                    kind,
                    context.max_duration.as_secs()
                )),
            };

        let (report, success) = match outcome {
            Ok((report, success)) => (Some(report), success),
            Err(e) => {
                error!(job = %kind, "Job run failed: {}", e);
                errors.push(e.to_string());
                (None, false)
            }
        };

        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        {
            let mut stats = context.statistics.write().await;
            let entry = stats.entry(kind).or_default();
            entry.total_runs += 1;
            if success {
                entry.successful_runs += 1;
                entry.last_successful_run = Some(completed_at);
            } else {
                entry.failed_runs += 1;
                entry.last_failed_run = Some(completed_at);
            }
            entry.avg_duration_seconds = (entry.avg_duration_seconds
                * (entry.total_runs - 1) as f64
                + duration_seconds)
                / entry.total_runs as f64;
        }
        if let Some(metrics) = &context.metrics {
            let result = if success { "success" } else { "failure" };
            metrics
                .job_runs_total
                .with_label_values(&[kind.as_str(), result])
                .inc();
        }

        context.running.lock().await.remove(&kind);

        Some(JobRunResult {
            run_id,
            job: kind,
            started_at,
            completed_at,
            duration_seconds,
            report,
            errors,
            success,
        })
    }

    async fn perform(
        context: &RunContext,
        kind: JobKind,
    ) -> anyhow::Result<(serde_json::Value, bool)> {
        let services = &context.services;
        match kind {
            JobKind::Sync => {
                let report = services.orchestrator.sync_all_active_accounts().await?;
                Ok((serde_json::to_value(&report)?, report.success))
            }
            JobKind::RealtimeSync => {
                let report = services.orchestrator.sync_realtime_accounts().await?;
                Ok((serde_json::to_value(&report)?, report.success))
            }
            JobKind::Learning => {
                let report = services.learning.run_weekly_learning().await?;
                Ok((serde_json::to_value(&report)?, report.success))
            }
            JobKind::Milestones => {
                let report = services.milestones.check_all_users().await?;
                Ok((serde_json::to_value(&report)?, report.success))
            }
            JobKind::Reconciliation => {
                let reports = services.orchestrator.dedup().reconcile_all_accounts().await?;
                let success = reports.iter().all(|r| r.error.is_none());
                if let Some(metrics) = &context.metrics {
                    metrics
                        .duplicate_rows_reconciled_total
                        .inc_by(reports.iter().map(|r| r.rows_deleted).sum());
                }
                Ok((serde_json::to_value(&reports)?, success))
            }
        }
    }

    pub async fn get_statistics(&self) -> HashMap<JobKind, JobStatistics> {
        self.context.statistics.read().await.clone()
    }

    pub async fn is_running(&self, kind: JobKind) -> bool {
        self.context.running.lock().await.contains(&kind)
    }

    /// Stops the cron engine and waits (bounded) for in-flight runs.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Shutting down job runner");
        let _ = self.shutdown_tx.send(());

        {
            let mut sched = self.scheduler.lock().await;
            sched
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to shutdown job scheduler: {}", e))?;
        }

        let wait_start = Utc::now();
        let max_wait = chrono::Duration::minutes(5);
        while !self.context.running.lock().await.is_empty() {
            if Utc::now() - wait_start > max_wait {
                warn!("Timeout waiting for jobs to complete during shutdown");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        info!("Job runner shutdown completed");
        Ok(())
    }
}
