//! Expands newly submitted jobs into test rows.

use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use crate::backends::{BackendResult, JobSource, JobStatusBackend, NewTest, TestIntakeBackend};
use crate::db::{JobId, JobStatus};
use crate::git::{GitError, RepoSource};
use crate::plan::{PlanError, TestPlan};

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("plan {plan}: {source}")]
    Plan {
        plan: String,
        #[source]
        source: PlanError,
    },
}

impl ExpandError {
    /// Plan errors are in the job's own data and cannot heal on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExpandError::Plan { .. })
    }
}

/// Turns a job's plan list into the tests to create.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn test_cases(&self, job: &JobSource) -> Result<Vec<NewTest>, ExpandError>;
}

/// Reads plans out of a fresh checkout of the job's tests repository.
pub struct RepoPlans<R> {
    repos: R,
}

impl<R: RepoSource> RepoPlans<R> {
    pub fn new(repos: R) -> Self {
        Self { repos }
    }
}

#[async_trait]
impl<R: RepoSource> PlanSource for RepoPlans<R> {
    async fn test_cases(&self, job: &JobSource) -> Result<Vec<NewTest>, ExpandError> {
        let checkout = self
            .repos
            .checkout(&job.tests_repo, &job.tests_repo_branch)
            .await?;

        let mut tests: Vec<NewTest> = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        for plan_path in &job.tests_plans {
            // A plan listed twice would otherwise create every case twice.
            if seen.contains(&plan_path.as_str()) {
                continue;
            }
            seen.push(plan_path);
            let plan = TestPlan::load(checkout.path(), plan_path)
                .await
                .map_err(|source| ExpandError::Plan {
                    plan: plan_path.clone(),
                    source,
                })?;
            for case in plan.tests {
                tests.push(NewTest {
                    test_case: case.name,
                    plan: plan_path.clone(),
                    tpm: case.spec.requirements.tpm,
                });
            }
        }
        Ok(tests)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeSummary {
    pub jobs_expanded: usize,
    pub tests_created: usize,
    /// Jobs left pending for the next tick.
    pub jobs_failed: usize,
    /// Jobs moved to `fail` because their plans are unusable.
    pub jobs_rejected: usize,
}

/// Expand every pending job without tests.
///
/// Clone and store failures are logged and leave the job for the next tick.
/// Unusable plans fail the job. Only failing to list new jobs aborts the step.
#[instrument(skip_all)]
pub async fn expand_new_jobs<B>(backend: &B, plans: &dyn PlanSource) -> BackendResult<IntakeSummary>
where
    B: TestIntakeBackend + JobStatusBackend + ?Sized,
{
    let mut summary = IntakeSummary::default();
    let job_ids = backend.new_job_ids().await?;
    if job_ids.is_empty() {
        return Ok(summary);
    }
    debug!(count = job_ids.len(), "found new jobs");

    for job_id in job_ids {
        let source = match backend.job_source(job_id).await {
            Ok(source) => source,
            Err(err) => {
                error!(job_id = %job_id, error = ?err, "failed to load job");
                summary.jobs_failed += 1;
                continue;
            }
        };

        let tests = match plans.test_cases(&source).await {
            Ok(tests) if tests.is_empty() => {
                error!(job_id = %job_id, "job plans declare no tests");
                reject_job(backend, job_id, &mut summary).await;
                continue;
            }
            Ok(tests) => tests,
            Err(err) if err.is_permanent() => {
                error!(
                    job_id = %job_id,
                    repo = %source.tests_repo,
                    branch = %source.tests_repo_branch,
                    error = %err,
                    "job plan is unusable"
                );
                reject_job(backend, job_id, &mut summary).await;
                continue;
            }
            Err(err) => {
                error!(
                    job_id = %job_id,
                    repo = %source.tests_repo,
                    branch = %source.tests_repo_branch,
                    error = %err,
                    "failed to expand job"
                );
                summary.jobs_failed += 1;
                continue;
            }
        };

        match backend.insert_tests(job_id, &tests).await {
            Ok(0) => debug!(job_id = %job_id, "job already expanded"),
            Ok(created) => {
                info!(job_id = %job_id, tests = created, "expanded job into tests");
                summary.jobs_expanded += 1;
                summary.tests_created += created;
            }
            Err(err) => {
                error!(job_id = %job_id, error = ?err, "failed to insert tests");
                summary.jobs_failed += 1;
            }
        }
    }

    Ok(summary)
}

async fn reject_job<B>(backend: &B, job_id: JobId, summary: &mut IntakeSummary)
where
    B: JobStatusBackend + ?Sized,
{
    match backend
        .set_job_status(job_id, JobStatus::Pending, JobStatus::Fail)
        .await
    {
        Ok(true) => {
            info!(job_id = %job_id, "job failed during intake");
            summary.jobs_rejected += 1;
        }
        Ok(false) => {
            debug!(job_id = %job_id, "job left pending concurrently");
            summary.jobs_failed += 1;
        }
        Err(err) => {
            error!(job_id = %job_id, error = ?err, "failed to fail job");
            summary.jobs_failed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backends::MemoryBackend;
    use crate::db::{NewJob, TestState};
    use crate::test_support::StubRepos;

    const REGULAR: &str = r#"
tests:
  Firefox-Example-Basic:
    entrypoint: tests/firefox-example/basic
  Firefox-Example-New-Tab:
    entrypoint: tests/firefox-example/new-tab
    requirements:
      tpm: true
"#;

    fn job(repo: &str, plans: &[&str]) -> NewJob {
        NewJob {
            id: JobId::new(),
            tests_repo: repo.to_string(),
            tests_repo_branch: "main".to_string(),
            tests_plans: plans.iter().map(|plan| plan.to_string()).collect(),
            image_url: "https://cdimage.ubuntu.com/noble/daily-live/current/noble.iso".to_string(),
            priority: 0,
            requester: "qa".to_string(),
            debug: false,
        }
    }

    #[tokio::test]
    async fn expands_two_case_plan_into_requested_tests() {
        let backend = MemoryBackend::new();
        let mut repos = StubRepos::default();
        repos
            .files
            .insert("good".to_string(), vec![("plans/regular.yaml", REGULAR)]);
        let plans = RepoPlans::new(repos);
        let job = job("good", &["plans/regular.yaml"]);
        backend.insert_job(&job).expect("insert job");

        let summary = expand_new_jobs(&backend, &plans).await.expect("expand");

        assert_eq!(summary.jobs_expanded, 1);
        assert_eq!(summary.tests_created, 2);
        let tests = backend.tests_for_job(job.id).expect("tests");
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().all(|test| test.state == TestState::Requested));
        assert!(tests.iter().all(|test| test.vnc_address.is_empty()
            && test.results_url.is_empty()
            && test.commit_hash.is_empty()));
        assert_eq!(tests[0].test_case, "Firefox-Example-Basic");
        assert!(!tests[0].tpm);
        assert!(tests[1].tpm);
        assert_eq!(tests[1].plan, "plans/regular.yaml");
    }

    #[tokio::test]
    async fn second_run_creates_no_duplicates() {
        let backend = MemoryBackend::new();
        let mut repos = StubRepos::default();
        repos
            .files
            .insert("good".to_string(), vec![("plans/regular.yaml", REGULAR)]);
        let plans = RepoPlans::new(repos);
        let job = job("good", &["plans/regular.yaml"]);
        backend.insert_job(&job).expect("insert job");

        expand_new_jobs(&backend, &plans).await.expect("first run");
        let second = expand_new_jobs(&backend, &plans).await.expect("second run");

        assert_eq!(second, IntakeSummary::default());
        assert_eq!(backend.tests_for_job(job.id).expect("tests").len(), 2);
    }

    #[tokio::test]
    async fn failing_job_does_not_block_others() {
        let backend = MemoryBackend::new();
        let mut repos = StubRepos::default();
        repos
            .files
            .insert("good".to_string(), vec![("plans/regular.yaml", REGULAR)]);
        repos.files.insert(
            "broken".to_string(),
            vec![("plans/regular.yaml", "tests: [not, a, mapping]\n")],
        );
        let checkouts = Arc::clone(&repos.checkouts);
        let plans = RepoPlans::new(repos);

        let broken = job("broken", &["plans/regular.yaml"]);
        let missing = job("missing", &["plans/regular.yaml"]);
        let good = job("good", &["plans/regular.yaml"]);
        for job in [&broken, &missing, &good] {
            backend.insert_job(job).expect("insert job");
        }

        let summary = expand_new_jobs(&backend, &plans).await.expect("expand");

        assert_eq!(summary.jobs_failed, 1);
        assert_eq!(summary.jobs_rejected, 1);
        assert_eq!(summary.jobs_expanded, 1);
        assert!(backend.tests_for_job(broken.id).expect("tests").is_empty());
        assert!(backend.tests_for_job(missing.id).expect("tests").is_empty());
        assert_eq!(backend.tests_for_job(good.id).expect("tests").len(), 2);
        assert_eq!(checkouts.lock().expect("checkouts poisoned").len(), 3);
    }

    fn job_status(backend: &MemoryBackend, job: &NewJob) -> JobStatus {
        backend.job(job.id).expect("job").expect("job exists").status
    }

    #[tokio::test]
    async fn unusable_plan_fails_the_job_once() {
        let backend = MemoryBackend::new();
        let mut repos = StubRepos::default();
        repos.files.insert(
            "broken".to_string(),
            vec![("plans/regular.yaml", "tests: [x]\n")],
        );
        let checkouts = Arc::clone(&repos.checkouts);
        let plans = RepoPlans::new(repos);
        let broken = job("broken", &["plans/regular.yaml"]);
        backend.insert_job(&broken).expect("insert job");

        for _ in 0..5 {
            expand_new_jobs(&backend, &plans).await.expect("expand");
        }

        assert_eq!(job_status(&backend, &broken), JobStatus::Fail);
        assert_eq!(checkouts.lock().expect("checkouts poisoned").len(), 1);
    }

    #[tokio::test]
    async fn clone_failure_is_retried_while_pending() {
        let backend = MemoryBackend::new();
        let repos = StubRepos::default();
        let checkouts = Arc::clone(&repos.checkouts);
        let plans = RepoPlans::new(repos);
        let missing = job("missing", &["plans/regular.yaml"]);
        backend.insert_job(&missing).expect("insert job");

        for _ in 0..3 {
            let summary = expand_new_jobs(&backend, &plans).await.expect("expand");
            assert_eq!(summary.jobs_failed, 1);
        }

        assert_eq!(job_status(&backend, &missing), JobStatus::Pending);
        assert_eq!(checkouts.lock().expect("checkouts poisoned").len(), 3);
    }

    #[tokio::test]
    async fn cases_are_created_per_plan_and_repeated_plans_once() {
        let backend = MemoryBackend::new();
        let mut repos = StubRepos::default();
        repos.files.insert(
            "good".to_string(),
            vec![
                ("plans/regular.yaml", REGULAR),
                ("plans/extended.yaml", REGULAR),
            ],
        );
        let plans = RepoPlans::new(repos);
        let job = job(
            "good",
            &["plans/regular.yaml", "plans/extended.yaml", "plans/regular.yaml"],
        );
        backend.insert_job(&job).expect("insert job");

        let summary = expand_new_jobs(&backend, &plans).await.expect("expand");

        assert_eq!(summary.tests_created, 4);
        let tests = backend.tests_for_job(job.id).expect("tests");
        assert_eq!(tests[2].plan, "plans/extended.yaml");
    }
}
