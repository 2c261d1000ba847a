//! Runner daemon.
//!
//! Claims spawned tests, runs the harness against their VM and uploads the
//! results.
//!
//! Configuration is via environment variables (a `.env` file is honored):
//! - VMTEST_DATABASE_URL: PostgreSQL connection string (required)
//! - VMTEST_STORAGE_PROVIDER: `local` or `swift`
//! - VMTEST_HARNESS_BINARY: harness executable (default: yarf)
//! - VMTEST_TEMPFAIL_EXIT_CODE: exit code that requeues a test

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmtest::git::GitCli;
use vmtest::polling::wait_for_signal;
use vmtest::runner::Harness;
use vmtest::{PostgresBackend, RunnerConfig, RunnerTask};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vmtest=info,vmtest_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RunnerConfig::from_env()?;
    info!(
        harness = %config.harness_binary,
        tempfail_exit_code = config.lease.tempfail_exit_code,
        "starting runner"
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

    let task = RunnerTask::new(
        backend,
        Arc::new(GitCli::default()),
        storage,
        Harness::new(config.harness_binary.clone()),
        config.lease,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(task.run(config.poll, shutdown_rx));

    wait_for_signal().await?;
    info!("shutting down runner");
    let _ = shutdown_tx.send(true);
    handle.await?;

    info!("runner stopped");
    Ok(())
}
