//! Reclaims tests whose worker stopped heartbeating.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::backends::{BackendResult, StalenessBackend};
use crate::db::TestState;

/// States owned by a worker that refreshes the heartbeat.
///
/// `spawned` is not listed: a VM waiting for a runner is heartbeated by its
/// spawner and requeued by it when the VM dies.
pub const RECLAIMABLE_STATES: [TestState; 2] = [TestState::Spawning, TestState::Running];

/// Reset stale `spawning` and `running` tests to `requested`.
///
/// Returns the number of tests reset.
#[instrument(skip_all, fields(inactive_secs = inactive_for.as_secs()))]
pub async fn reset_stale_tests<B>(backend: &B, inactive_for: Duration) -> BackendResult<usize>
where
    B: StalenessBackend + ?Sized,
{
    let mut reset = 0;
    for state in RECLAIMABLE_STATES {
        let stale = backend.stale_test_ids(state, inactive_for).await?;
        if stale.is_empty() {
            continue;
        }
        let count = backend
            .reset_stale_tests(&stale, state, inactive_for)
            .await?;
        if count > 0 {
            warn!(
                state = %state,
                count,
                inactive_secs = inactive_for.as_secs(),
                test_ids = ?stale,
                "reset stale tests to requested"
            );
        }
        if count < stale.len() {
            debug!(
                state = %state,
                skipped = stale.len() - count,
                "stale tests refreshed before reset"
            );
        }
        reset += count;
    }
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, TestLeaseBackend};
    use crate::test_support::{job_with_tests, sample_job};

    #[tokio::test]
    async fn spawning_test_five_minutes_old_is_requeued() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(&backend, sample_job(0), &[TestState::Spawning]).await;
        backend
            .set_vnc_address(ids[0], "10.0.0.5:5901")
            .await
            .expect("address");
        backend
            .backdate_test(ids[0], Duration::from_secs(5 * 60))
            .expect("backdate");

        let reset = reset_stale_tests(&backend, Duration::from_secs(2 * 60))
            .await
            .expect("reset");

        assert_eq!(reset, 1);
        let test = backend.test(ids[0]).expect("test").expect("exists");
        assert_eq!(test.state, TestState::Requested);
        assert_eq!(test.vnc_address, "");
    }

    #[tokio::test]
    async fn only_reclaimable_states_past_the_interval_are_reset() {
        let backend = MemoryBackend::new();
        let (_, ids) = job_with_tests(
            &backend,
            sample_job(0),
            &[
                TestState::Running,
                TestState::Running,
                TestState::Spawned,
                TestState::Requested,
                TestState::Pass,
            ],
        )
        .await;
        for (index, id) in ids.iter().enumerate() {
            // Leave the second running test fresh.
            if index != 1 {
                backend
                    .backdate_test(*id, Duration::from_secs(600))
                    .expect("backdate");
            }
        }

        let reset = reset_stale_tests(&backend, Duration::from_secs(120))
            .await
            .expect("reset");

        assert_eq!(reset, 1);
        let states: Vec<TestState> = ids
            .iter()
            .map(|id| backend.test(*id).expect("test").expect("exists").state)
            .collect();
        assert_eq!(
            states,
            vec![
                TestState::Requested,
                TestState::Running,
                TestState::Spawned,
                TestState::Requested,
                TestState::Pass,
            ]
        );
    }
}
