use anyhow::Result;
use clap::{Parser, Subcommand};
use mailflow_core::application::*;
use mailflow_core::storage::{create_pool, run_migrations};
use mailflow_core::Config;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "mailflow")]
#[command(about = "Email sync, deduplication and learning scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, background AI worker and trigger API (default)
    Serve,
    /// Sync all active accounts, or one account
    Sync {
        #[arg(long)]
        account_id: Option<Uuid>,
        /// Discard the stored cursor and fetch the full lookback window
        #[arg(long, requires = "account_id")]
        force_full: bool,
    },
    /// Run incremental learning for eligible users, or one user
    Learn {
        #[arg(long)]
        user_id: Option<Uuid>,
    },
    /// Announce newly reached volume milestones
    Milestones,
    /// Remove duplicate indexed rows left by earlier runs
    Reconcile {
        #[arg(long)]
        account_id: Option<Uuid>,
    },
    /// Apply database migrations
    Migrate,
    /// Check store, AI layer and queue health
    Health,
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},mailflow_core=debug", config.operational.log_level))
    });
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // stdout carries JSON reports, so logs go to stderr.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env()?;
    init_logging(&config);
    config.validate()?;

    if let Some(Commands::Migrate) = cli.command {
        let pool = create_pool(&config.database_url, 2).await?;
        run_migrations(&pool).await?;
        info!("✅ Migrations applied to {}", config.safe_database_url());
        return Ok(());
    }

    let app = Application::new(config).await?;
    app.initialize().await?;

    match cli.command {
        Some(Commands::Sync { account_id, force_full }) => {
            SyncCommandHandler::new(app.container.clone())
                .sync(account_id, force_full)
                .await
        }
        Some(Commands::Reconcile { account_id }) => {
            SyncCommandHandler::new(app.container.clone())
                .reconcile(account_id)
                .await
        }
        Some(Commands::Learn { user_id }) => {
            LearningCommandHandler::new(app.container.clone())
                .run(user_id)
                .await
        }
        Some(Commands::Milestones) => {
            LearningCommandHandler::new(app.container.clone())
                .milestones()
                .await
        }
        Some(Commands::Health) => {
            let healthy = HealthCommandHandler::new(app.container.clone())
                .run_health_check()
                .await?;
            if !healthy {
                return Err(anyhow::anyhow!("System is unhealthy"));
            }
            Ok(())
        }
        Some(Commands::Serve) | None => app.lifecycle.serve().await,
        Some(Commands::Migrate) => Ok(()),
    }
}
