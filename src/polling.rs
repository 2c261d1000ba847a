//! Tick loop shared by the three daemons.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::PollInterval;

/// Pick a sleep duration uniformly within the poll bounds.
///
/// Randomizing the sleep keeps replicas of the same daemon from polling the
/// store in lockstep.
pub fn jitter(poll: PollInterval) -> Duration {
    if poll.min >= poll.max {
        return poll.min;
    }
    let min = poll.min.as_millis() as u64;
    let max = poll.max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

/// Resolve once shutdown has been requested or the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `tick`, sleep a jittered interval, repeat until shutdown.
///
/// A failing tick is logged and the loop carries on; store outages only cost
/// the current tick.
pub async fn run_loop<F, Fut>(
    name: &'static str,
    poll: PollInterval,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(
        daemon = name,
        poll_min_ms = poll.min.as_millis() as u64,
        poll_max_ms = poll.max.as_millis() as u64,
        "daemon loop started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = tick(shutdown.clone()).await {
            error!(daemon = name, error = ?err, "tick failed");
        }
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(jitter(poll)) => {}
        }
    }

    info!(daemon = name, "daemon loop shutting down");
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}
