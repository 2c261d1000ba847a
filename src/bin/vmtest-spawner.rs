//! Spawner daemon.
//!
//! Claims requested tests, boots a VM for each and advertises its VNC
//! endpoint until the runner is done with it. Run one spawner per VNC port.
//!
//! Configuration is via flags and environment variables:
//! - --host / VMTEST_VNC_HOST: address runners use to reach this host's VMs
//! - --port / VMTEST_VNC_PORT: VNC port for this spawner (5900 + display)
//! - VMTEST_DATABASE_URL: PostgreSQL connection string (required)
//! - VMTEST_IMAGE_CACHE_PATH: where images and scratch disks live
//! - VMTEST_CHECKSUM_DOMAINS: hosts publishing `SHA256SUMS` manifests
//! - VMTEST_VM_MEMORY_MB / VMTEST_VM_CORES / VMTEST_VM_DISK_GB: VM sizing

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vmtest::config::VncEndpoint;
use vmtest::polling::wait_for_signal;
use vmtest::spawner::{ImageCache, QemuLauncher};
use vmtest::{PostgresBackend, SpawnerConfig, SpawnerTask};

#[derive(Parser, Debug)]
#[command(name = "vmtest-spawner", about = "Provision VMs for requested tests")]
struct Args {
    /// Host name or address runners connect to.
    #[arg(long, env = "VMTEST_VNC_HOST")]
    host: String,

    /// VNC port served by this spawner's VM.
    #[arg(long, env = "VMTEST_VNC_PORT", default_value_t = 5901)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vmtest=info,vmtest_spawner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let vnc = VncEndpoint::new(args.host, args.port)?;
    let config = SpawnerConfig::from_env(vnc)?;
    info!(
        vnc = %config.vnc.address(),
        image_cache = %config.image_cache.display(),
        memory_mb = config.vm.memory_mb,
        cores = config.vm.cores,
        "starting spawner"
    );

    tokio::fs::create_dir_all(&config.image_cache)
        .await
        .with_context(|| {
            format!(
                "failed to create image cache {}",
                config.image_cache.display()
            )
        })?;

    let backend = PostgresBackend::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let task = SpawnerTask::new(
        backend,
        Arc::new(ImageCache::new(
            config.image_cache.clone(),
            config.checksum_domains.clone(),
        )),
        Arc::new(QemuLauncher::new(config.vm, config.image_cache.clone())),
        config.vnc.clone(),
        config.vm,
        config.lease,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(task.run(config.poll, shutdown_rx));

    wait_for_signal().await?;
    info!("shutting down spawner");
    let _ = shutdown_tx.send(true);
    handle.await?;

    info!("spawner stopped");
    Ok(())
}
