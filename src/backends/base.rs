//! Store capability interfaces shared by the scheduler, spawner and runner.
//!
//! Every mutation that moves a test between states is conditional on the
//! state the caller expects, so two daemons racing on one row can never both
//! succeed. Methods that report `bool` return `false` when the precondition
//! no longer held.

use std::time::Duration;

use async_trait::async_trait;

use crate::db::{JobId, JobStatus, TestId, TestRecord, TestState};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("unknown {kind} value in store: {value}")]
    InvalidValue { kind: &'static str, value: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Repository coordinates of a job, used to expand it into tests.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSource {
    pub job_id: JobId,
    pub tests_repo: String,
    pub tests_repo_branch: String,
    pub tests_plans: Vec<String>,
}

/// One test row to create during expansion.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTest {
    pub test_case: String,
    pub plan: String,
    pub tpm: bool,
}

/// A job considered by the completion aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobStatusEntry {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// A test claimed by a worker together with the job fields it needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimedTest {
    pub test: TestRecord,
    pub tests_repo: String,
    pub tests_repo_branch: String,
    pub image_url: String,
    pub priority: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Summary of deleting one job's rows.
pub struct RetentionResult {
    pub deleted_tests: usize,
    pub deleted_jobs: usize,
}

/// Backend capability for expanding new jobs into test rows.
#[async_trait]
pub trait TestIntakeBackend: Send + Sync {
    /// Jobs that no test row references yet.
    async fn new_job_ids(&self) -> BackendResult<Vec<JobId>>;

    async fn job_source(&self, job_id: JobId) -> BackendResult<JobSource>;

    /// Insert all tests of a job at once.
    ///
    /// Inserts nothing (and returns 0) when the job already has tests, which
    /// keeps expansion idempotent across ticks.
    async fn insert_tests(&self, job_id: JobId, tests: &[NewTest]) -> BackendResult<usize>;
}

/// Backend capability for projecting test states onto job status.
#[async_trait]
pub trait JobStatusBackend: Send + Sync {
    async fn jobs_with_status(&self, statuses: &[JobStatus])
    -> BackendResult<Vec<JobStatusEntry>>;

    async fn test_states(&self, job_id: JobId) -> BackendResult<Vec<TestState>>;

    /// Set a job's status if it still has the `from` status.
    async fn set_job_status(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> BackendResult<bool>;
}

/// Backend capability for reclaiming tests abandoned by a dead worker.
#[async_trait]
pub trait StalenessBackend: Send + Sync {
    /// Tests in `state` whose heartbeat is older than `inactive_for`,
    /// measured against the store clock.
    async fn stale_test_ids(
        &self,
        state: TestState,
        inactive_for: Duration,
    ) -> BackendResult<Vec<TestId>>;

    /// Reset the given tests to `requested`, clearing their address.
    ///
    /// Only rows still in `state` and still stale are touched.
    async fn reset_stale_tests(
        &self,
        ids: &[TestId],
        state: TestState,
        inactive_for: Duration,
    ) -> BackendResult<usize>;
}

/// Backend capability for deleting expired jobs.
#[async_trait]
pub trait RetentionBackend: Send + Sync {
    /// Delete a job's tests and then the job itself in one transaction.
    async fn delete_job(&self, job_id: JobId) -> BackendResult<RetentionResult>;
}

/// Backend capability used by the spawner and runner to lease tests.
#[async_trait]
pub trait TestLeaseBackend: Send + Sync {
    /// Atomically move the highest-priority test in `from` to `to` and stamp
    /// its heartbeat.
    ///
    /// Ties are broken by job submission time and then test id. When
    /// `require_address` is set only tests with a published VNC address are
    /// eligible.
    async fn claim_test(
        &self,
        from: TestState,
        to: TestState,
        require_address: bool,
    ) -> BackendResult<Option<ClaimedTest>>;

    async fn transition(&self, id: TestId, from: TestState, to: TestState) -> BackendResult<bool>;

    /// Refresh the heartbeat of a test the caller still holds in `expected`.
    async fn heartbeat(&self, id: TestId, expected: TestState) -> BackendResult<bool>;

    async fn set_vnc_address(&self, id: TestId, address: &str) -> BackendResult<()>;

    /// Environment failure: clear the address and send the test back to
    /// `requested`.
    async fn requeue(&self, id: TestId, from: TestState) -> BackendResult<bool>;

    async fn set_commit_hash(&self, id: TestId, commit_hash: &str) -> BackendResult<()>;

    /// Record the results url and move a `running` test to `outcome`.
    async fn finish_test(
        &self,
        id: TestId,
        results_url: &str,
        outcome: TestState,
    ) -> BackendResult<bool>;

    async fn test_state(&self, id: TestId) -> BackendResult<Option<TestState>>;
}

pub(crate) fn parse_test_state(value: &str) -> BackendResult<TestState> {
    TestState::parse(value).ok_or_else(|| BackendError::InvalidValue {
        kind: "test state",
        value: value.to_string(),
    })
}

pub(crate) fn parse_job_status(value: &str) -> BackendResult<JobStatus> {
    JobStatus::parse(value).ok_or_else(|| BackendError::InvalidValue {
        kind: "job status",
        value: value.to_string(),
    })
}
