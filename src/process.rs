//! Heartbeat-guarded work and child processes.
//!
//! Long operations (image download, git clone, a VM, the harness) must keep
//! refreshing the test's heartbeat or Staleness Recovery will reclaim the
//! test. These helpers run the work while ticking a heartbeat callback and
//! stop early when the callback reports that the lease is gone or when the
//! daemon is shutting down.

use std::future::Future;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

use crate::polling::shutdown_requested;

/// What the heartbeat callback wants the supervisor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Continue,
    /// The lease is gone; abandon the work.
    Release,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Supervised<T> {
    Finished(T),
    Released,
    Shutdown,
}

/// Drive `work` to completion while calling `beat` every `every`.
pub async fn guarded<W, T, F, Fut>(
    work: W,
    every: Duration,
    shutdown: &mut watch::Receiver<bool>,
    mut beat: F,
) -> Supervised<T>
where
    W: Future<Output = T>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Heartbeat>,
{
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(work);

    loop {
        tokio::select! {
            output = &mut work => return Supervised::Finished(output),
            _ = shutdown_requested(shutdown) => return Supervised::Shutdown,
            _ = ticker.tick() => {
                if beat().await == Heartbeat::Release {
                    return Supervised::Released;
                }
            }
        }
    }
}

/// Wait for `child` under a heartbeat, killing it when released or on
/// shutdown.
pub async fn supervise_child<F, Fut>(
    child: &mut Child,
    every: Duration,
    shutdown: &mut watch::Receiver<bool>,
    beat: F,
) -> io::Result<Supervised<ExitStatus>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Heartbeat>,
{
    let outcome = guarded(child.wait(), every, shutdown, beat).await;
    match outcome {
        Supervised::Finished(status) => Ok(Supervised::Finished(status?)),
        Supervised::Released => {
            debug!(pid = ?child.id(), "killing child after lease release");
            child.kill().await?;
            Ok(Supervised::Released)
        }
        Supervised::Shutdown => {
            debug!(pid = ?child.id(), "killing child on shutdown");
            child.kill().await?;
            Ok(Supervised::Shutdown)
        }
    }
}
