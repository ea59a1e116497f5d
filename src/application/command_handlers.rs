use crate::application::DependencyContainer;
use crate::monitoring::HealthStatus;
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reports go to stdout as pretty JSON; logs stay on stderr.
fn print_report<T: Serialize>(report: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// One-shot sync runs, followed by a drain of the processing queue so
/// handed-off batches are classified before the process exits.
pub struct SyncCommandHandler {
    container: Arc<DependencyContainer>,
}

impl SyncCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn sync(&self, account_id: Option<Uuid>, force_full: bool) -> Result<()> {
        let report = match account_id {
            Some(id) => {
                info!(account_id = %id, force_full, "🔄 Syncing single account");
                self.container.orchestrator.sync_account(id, force_full).await?
            }
            None => {
                if force_full {
                    warn!("--force-full only applies with --account-id; running a normal sync");
                }
                self.container.orchestrator.sync_all_active_accounts().await?
            }
        };

        let batches = self.container.drain_processing_queue().await;
        if !batches.is_empty() {
            let failed: usize = batches.iter().map(|b| b.failed).sum();
            info!(batches = batches.len(), failed, "Processed handed-off batches");
        }

        print_report(&report)
    }

    pub async fn reconcile(&self, account_id: Option<Uuid>) -> Result<()> {
        let dedup = self.container.orchestrator.dedup();
        match account_id {
            Some(id) => print_report(&dedup.reconcile_existing(id).await?),
            None => print_report(&dedup.reconcile_all_accounts().await?),
        }
    }
}

pub struct LearningCommandHandler {
    container: Arc<DependencyContainer>,
}

impl LearningCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run(&self, user_id: Option<Uuid>) -> Result<()> {
        let scheduler = &self.container.learning_scheduler;
        let report = match user_id {
            Some(id) => scheduler.run_learning_for_user(id).await?,
            None => scheduler.run_weekly_learning().await?,
        };
        print_report(&report)
    }

    pub async fn milestones(&self) -> Result<()> {
        let report = self.container.milestone_gate.check_all_users().await?;
        print_report(&report)
    }
}

pub struct HealthCommandHandler {
    container: Arc<DependencyContainer>,
}

impl HealthCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Returns false when the system is unhealthy.
    pub async fn run_health_check(&self) -> Result<bool> {
        info!("🏥 Running system health check...");
        let health = self.container.health_checker.check_system_health().await;

        for (component, component_health) in &health.components {
            match component_health.status {
                HealthStatus::Healthy => info!("✅ {}: Healthy", component),
                HealthStatus::Degraded => warn!(
                    "⚠️  {}: Degraded - {:?}",
                    component, component_health.message
                ),
                HealthStatus::Unhealthy => error!(
                    "❌ {}: Unhealthy - {:?}",
                    component, component_health.message
                ),
            }
        }

        print_report(&health)?;
        Ok(health.status != HealthStatus::Unhealthy)
    }
}
