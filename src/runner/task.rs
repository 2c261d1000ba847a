//! Executor loop: claims spawned tests and runs the harness against them.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::archive::archive_dir_blocking;
use super::harness::{Harness, VncTarget};
use crate::backends::{ClaimedTest, TestLeaseBackend};
use crate::config::{LeaseConfig, PollInterval};
use crate::db::{TestId, TestState};
use crate::git::RepoSource;
use crate::plan::TestPlan;
use crate::polling::run_loop;
use crate::process::{Heartbeat, Supervised, guarded, supervise_child};
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// No spawned test was waiting.
    Idle,
    /// The test reached `pass` or `fail`.
    Finished(TestState),
    /// The harness reported an environment failure; the test was requeued.
    Requeued,
    /// The test was reclaimed while running.
    Released,
    Shutdown,
}

pub struct RunnerTask<B> {
    backend: B,
    repos: Arc<dyn RepoSource>,
    storage: Arc<dyn StorageBackend>,
    harness: Harness,
    lease: LeaseConfig,
}

impl<B> RunnerTask<B>
where
    B: TestLeaseBackend,
{
    pub fn new(
        backend: B,
        repos: Arc<dyn RepoSource>,
        storage: Arc<dyn StorageBackend>,
        harness: Harness,
        lease: LeaseConfig,
    ) -> Self {
        Self {
            backend,
            repos,
            storage,
            harness,
            lease,
        }
    }

    /// Claim one spawned test and run it to an outcome.
    ///
    /// Clone, archive and upload failures return an error and leave the test
    /// `running`, where staleness recovery picks it up.
    pub async fn tick(&self, mut shutdown: watch::Receiver<bool>) -> Result<RunOutcome> {
        let Some(claimed) = self
            .backend
            .claim_test(TestState::Spawned, TestState::Running, true)
            .await
            .context("failed to claim spawned test")?
        else {
            return Ok(RunOutcome::Idle);
        };
        let test = &claimed.test;
        let id = test.id;
        info!(
            test_id = %id,
            job_id = %test.job_id,
            test_case = %test.test_case,
            vnc_address = %test.vnc_address,
            "claimed test for execution"
        );

        let checkout = match guarded(
            self.repos
                .checkout(&claimed.tests_repo, &claimed.tests_repo_branch),
            self.lease.heartbeat_interval,
            &mut shutdown,
            || self.beat(id),
        )
        .await
        {
            Supervised::Finished(checkout) => checkout.with_context(|| {
                format!(
                    "failed to clone {} ({}) for test {id}",
                    claimed.tests_repo, claimed.tests_repo_branch
                )
            })?,
            Supervised::Released => return Ok(RunOutcome::Released),
            Supervised::Shutdown => return Ok(RunOutcome::Shutdown),
        };
        self.backend
            .set_commit_hash(id, checkout.commit_hash())
            .await
            .context("failed to record commit hash")?;
        debug!(test_id = %id, commit = checkout.commit_hash(), "checked out tests");

        let entrypoint = match TestPlan::load(checkout.path(), &test.plan).await {
            Ok(plan) => plan.entrypoint_for(&test.test_case).map(str::to_owned),
            Err(err) => {
                error!(test_id = %id, plan = %test.plan, error = %err, "failed to load plan");
                None
            }
        };
        let Some(entrypoint) = entrypoint else {
            return self
                .fail_without_results(&claimed, "no entrypoint for test case")
                .await;
        };
        let Some(target) = VncTarget::parse(&test.vnc_address) else {
            return self
                .fail_without_results(&claimed, "unparseable vnc address")
                .await;
        };

        let outdir = tempfile::Builder::new()
            .prefix("vmtest-artifacts-")
            .tempdir()
            .context("failed to create artifacts directory")?;
        let mut child = self.harness.spawn(
            checkout.path(),
            &target,
            &entrypoint,
            outdir.path(),
            &test.test_case,
        )?;

        let status = match supervise_child(
            &mut child,
            self.lease.heartbeat_interval,
            &mut shutdown,
            || self.beat(id),
        )
        .await
        .context("failed to wait for harness")?
        {
            Supervised::Finished(status) => status,
            Supervised::Released => {
                warn!(test_id = %id, "test reclaimed while running; harness killed");
                return Ok(RunOutcome::Released);
            }
            Supervised::Shutdown => {
                info!(test_id = %id, "harness killed on shutdown");
                return Ok(RunOutcome::Shutdown);
            }
        };

        if status.code() == Some(self.lease.tempfail_exit_code) {
            warn!(test_id = %id, %status, "harness reported an environment failure");
            if self
                .backend
                .requeue(id, TestState::Running)
                .await
                .context("failed to requeue test")?
            {
                return Ok(RunOutcome::Requeued);
            }
            return Ok(RunOutcome::Released);
        }

        let bundle = archive_dir_blocking(outdir.path().to_path_buf())
            .await
            .context("failed to archive artifacts")?;
        let namespace = test.job_id.to_string();
        let object = format!("{}-{}.tar.gz", test.job_id, id);
        let results_url = self
            .storage
            .upload(&namespace, &object, bundle)
            .await
            .context("failed to upload artifacts")?;

        let outcome = if status.success() {
            TestState::Pass
        } else {
            TestState::Fail
        };
        if !self
            .backend
            .finish_test(id, &results_url, outcome)
            .await
            .context("failed to record test outcome")?
        {
            warn!(test_id = %id, "test reclaimed before its outcome was recorded");
            return Ok(RunOutcome::Released);
        }
        info!(test_id = %id, outcome = %outcome, %results_url, "test finished");
        Ok(RunOutcome::Finished(outcome))
    }

    /// Data errors cannot succeed on retry, so the test fails outright.
    async fn fail_without_results(&self, claimed: &ClaimedTest, reason: &str) -> Result<RunOutcome> {
        let test = &claimed.test;
        error!(
            test_id = %test.id,
            job_id = %test.job_id,
            test_case = %test.test_case,
            plan = %test.plan,
            vnc_address = %test.vnc_address,
            reason,
            "failing test"
        );
        if self
            .backend
            .finish_test(test.id, "", TestState::Fail)
            .await
            .context("failed to record test outcome")?
        {
            Ok(RunOutcome::Finished(TestState::Fail))
        } else {
            Ok(RunOutcome::Released)
        }
    }

    async fn beat(&self, id: TestId) -> Heartbeat {
        match self.backend.heartbeat(id, TestState::Running).await {
            Ok(true) => Heartbeat::Continue,
            Ok(false) => Heartbeat::Release,
            Err(err) => {
                warn!(test_id = %id, error = ?err, "heartbeat failed");
                Heartbeat::Continue
            }
        }
    }

    /// Execute tests until shutdown is requested.
    pub async fn run(self, poll: PollInterval, shutdown: watch::Receiver<bool>) {
        let task = &self;
        run_loop("runner", poll, shutdown, |shutdown| async move {
            task.tick(shutdown).await.map(|_| ())
        })
        .await;
    }
}
