//! Scheduler daemon.
//!
//! Expands new jobs into tests, aggregates job status, resets stale tests
//! and expires old artifacts.
//!
//! Configuration is via environment variables (a `.env` file is honored):
//! - VMTEST_DATABASE_URL: PostgreSQL connection string (required)
//! - VMTEST_POLL_MIN_MS / VMTEST_POLL_MAX_MS: tick interval bounds
//! - VMTEST_STORAGE_PROVIDER: `local` or `swift`
//! - VMTEST_TEST_INACTIVE_RESET_SECS: heartbeat age before a test is reclaimed
//! - VMTEST_ARTIFACT_RETENTION_DAYS: artifact lifetime

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmtest::git::GitCli;
use vmtest::polling::wait_for_signal;
use vmtest::scheduler::RepoPlans;
use vmtest::{PostgresBackend, SchedulerConfig, SchedulerTask};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vmtest=info,vmtest_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SchedulerConfig::from_env()?;
    info!(
        poll_min = ?config.poll.min,
        poll_max = ?config.poll.max,
        test_inactive_reset = ?config.test_inactive_reset,
        artifact_retention = ?config.artifact_retention,
        "starting scheduler"
    );

    let backend = PostgresBackend::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let storage = config
        .storage
        .connect()
        .await
        .context("failed to initialize artifact storage")?;

    let task = SchedulerTask::new(
        backend,
        storage,
        Arc::new(RepoPlans::new(GitCli::default())),
        config.test_inactive_reset,
        config.artifact_retention,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(task.run(config.poll, shutdown_rx));

    wait_for_signal().await?;
    info!("shutting down scheduler");
    let _ = shutdown_tx.send(true);
    handle.await?;

    info!("scheduler stopped");
    Ok(())
}
