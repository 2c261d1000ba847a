//! Background scheduler task.
//!
//! Every tick runs the four scheduler steps in order: job intake, job status
//! aggregation, staleness recovery and retention. A failing step is logged
//! and the remaining steps still run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{
    IntakeSummary, PlanSource, aggregate_job_status, enforce_retention, expand_new_jobs,
    reset_stale_tests,
};
use crate::backends::{JobStatusBackend, RetentionBackend, StalenessBackend, TestIntakeBackend};
use crate::config::PollInterval;
use crate::polling::run_loop;
use crate::storage::StorageBackend;

/// Everything the scheduler needs from the store.
pub trait SchedulerBackend:
    TestIntakeBackend + JobStatusBackend + StalenessBackend + RetentionBackend
{
}

impl<T> SchedulerBackend for T where
    T: TestIntakeBackend + JobStatusBackend + StalenessBackend + RetentionBackend
{
}

/// Background scheduler task.
pub struct SchedulerTask<B> {
    backend: B,
    storage: Arc<dyn StorageBackend>,
    plans: Arc<dyn PlanSource>,
    test_inactive_reset: Duration,
    artifact_retention: Duration,
}

impl<B> SchedulerTask<B>
where
    B: SchedulerBackend,
{
    pub fn new(
        backend: B,
        storage: Arc<dyn StorageBackend>,
        plans: Arc<dyn PlanSource>,
        test_inactive_reset: Duration,
        artifact_retention: Duration,
    ) -> Self {
        Self {
            backend,
            storage,
            plans,
            test_inactive_reset,
            artifact_retention,
        }
    }

    /// Run one pass of every scheduler step.
    ///
    /// Returns an error naming the failed steps after all of them ran.
    pub async fn tick(&self) -> Result<()> {
        let mut failed: Vec<&'static str> = Vec::new();

        match expand_new_jobs(&self.backend, self.plans.as_ref()).await {
            Ok(summary) if summary != IntakeSummary::default() => info!(
                jobs = summary.jobs_expanded,
                tests = summary.tests_created,
                failed = summary.jobs_failed,
                rejected = summary.jobs_rejected,
                "job intake finished"
            ),
            Ok(_) => debug!("no new jobs"),
            Err(err) => {
                error!(error = ?err, "job intake failed");
                failed.push("intake");
            }
        }

        match aggregate_job_status(&self.backend).await {
            Ok(updated) => debug!(updated, "job status aggregated"),
            Err(err) => {
                error!(error = ?err, "job status aggregation failed");
                failed.push("aggregate");
            }
        }

        match reset_stale_tests(&self.backend, self.test_inactive_reset).await {
            Ok(reset) => debug!(reset, "staleness recovery finished"),
            Err(err) => {
                error!(error = ?err, "staleness recovery failed");
                failed.push("staleness");
            }
        }

        match enforce_retention(&self.backend, self.storage.as_ref(), self.artifact_retention).await
        {
            Ok(summary) if summary.namespaces_removed > 0 => info!(
                namespaces = summary.namespaces_removed,
                jobs = summary.jobs_deleted,
                tests = summary.tests_deleted,
                failures = summary.failures,
                "retention enforced"
            ),
            Ok(_) => debug!("nothing past retention"),
            Err(err) => {
                error!(error = ?err, "retention failed");
                failed.push("retention");
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("scheduler steps failed: {}", failed.join(", ")))
        }
    }

    /// Tick until shutdown is requested.
    pub async fn run(self, poll: PollInterval, shutdown: watch::Receiver<bool>) {
        let task = &self;
        run_loop("scheduler", poll, shutdown, |_| task.tick()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, TestLeaseBackend};
    use crate::db::{JobStatus, TestState};
    use crate::scheduler::RepoPlans;
    use crate::test_support::{RecordingStorage, StubRepos, job_with_tests, sample_job};

    const PLAN: &str = r#"
tests:
  Firefox-Example-Basic:
    entrypoint: tests/firefox-example/basic
  Firefox-Example-New-Tab:
    entrypoint: tests/firefox-example/new-tab
"#;

    fn task(backend: MemoryBackend, storage: RecordingStorage) -> SchedulerTask<MemoryBackend> {
        let repos = StubRepos::default().with_repo(
            "https://example.com/acceptance-tests.git",
            vec![("tests/firefox-example/plans/regular.yaml", PLAN)],
        );
        SchedulerTask::new(
            backend,
            Arc::new(storage),
            Arc::new(RepoPlans::new(repos)),
            Duration::from_secs(120),
            Duration::from_secs(30 * 24 * 60 * 60),
        )
    }

    #[tokio::test]
    async fn tick_expands_and_then_aggregates_a_new_job() {
        let backend = MemoryBackend::new();
        let job = sample_job(0);
        backend.insert_job(&job).expect("insert job");
        let scheduler = task(backend.clone(), RecordingStorage::default());

        scheduler.tick().await.expect("tick");

        let tests = backend.tests_for_job(job.id).expect("tests");
        assert_eq!(tests.len(), 2);
        let record = backend.job(job.id).expect("job").expect("exists");
        assert_eq!(record.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn tick_requeues_stale_work_and_finishes_jobs() {
        let backend = MemoryBackend::new();
        let (stale_job, stale) =
            job_with_tests(&backend, sample_job(0), &[TestState::Running]).await;
        let (done_job, _) =
            job_with_tests(&backend, sample_job(0), &[TestState::Pass, TestState::Pass]).await;
        backend
            .backdate_test(stale[0], Duration::from_secs(600))
            .expect("backdate");
        let scheduler = task(backend.clone(), RecordingStorage::default());

        scheduler.tick().await.expect("tick");

        assert_eq!(
            backend.test_state(stale[0]).await.expect("state"),
            Some(TestState::Requested)
        );
        let done = backend.job(done_job).expect("job").expect("exists");
        assert_eq!(done.status, JobStatus::Pass);
        let stale_record = backend.job(stale_job).expect("job").expect("exists");
        assert_eq!(stale_record.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn tick_deletes_expired_jobs() {
        let backend = MemoryBackend::new();
        let (expired, _) = job_with_tests(&backend, sample_job(0), &[TestState::Pass]).await;
        let storage = RecordingStorage::default();
        storage
            .expired
            .lock()
            .expect("expired poisoned")
            .push(expired.to_string());
        let scheduler = task(backend.clone(), storage.clone());

        scheduler.tick().await.expect("tick");

        assert!(backend.job(expired).expect("job").is_none());
        assert_eq!(
            *storage.removal_ages.lock().expect("removal ages poisoned"),
            vec![Duration::from_secs(30 * 24 * 60 * 60)]
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let scheduler = task(MemoryBackend::new(), RecordingStorage::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            scheduler
                .run(PollInterval::from_millis(10, 20), shutdown_rx)
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler stopped")
            .expect("join");
    }
}
