//! In-memory backend with the same conditional-update semantics as Postgres.
//!
//! The process clock stands in for the store clock.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::base::{
    BackendError, BackendResult, ClaimedTest, JobSource, JobStatusBackend, JobStatusEntry,
    NewTest, RetentionBackend, RetentionResult, StalenessBackend, TestIntakeBackend,
    TestLeaseBackend,
};
use crate::db::{JobId, JobRecord, JobStatus, NewJob, TestId, TestRecord, TestState};

#[derive(Default)]
struct MemoryStore {
    jobs: Vec<JobRecord>,
    tests: Vec<TestRecord>,
    next_test_id: i64,
}

impl MemoryStore {
    fn job(&self, job_id: JobId) -> Option<&JobRecord> {
        self.jobs.iter().find(|job| job.id == job_id)
    }

    fn test_mut(&mut self, id: TestId) -> Option<&mut TestRecord> {
        self.tests.iter_mut().find(|test| test.id == id)
    }

    /// Apply `update` to a test if it is currently in `expected`.
    fn update_if(
        &mut self,
        id: TestId,
        expected: TestState,
        update: impl FnOnce(&mut TestRecord),
    ) -> bool {
        match self.test_mut(id) {
            Some(test) if test.state == expected => {
                update(test);
                test.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

/// Backend that keeps jobs and tests in memory for tests or local runs.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BackendResult<MutexGuard<'_, MemoryStore>> {
        self.store
            .lock()
            .map_err(|_| BackendError::Message("memory store poisoned".to_string()))
    }

    pub fn insert_job(&self, job: &NewJob) -> BackendResult<()> {
        self.insert_job_at(job, Utc::now())
    }

    /// Insert a job with an explicit submission time.
    pub fn insert_job_at(&self, job: &NewJob, submitted_at: DateTime<Utc>) -> BackendResult<()> {
        let mut store = self.lock()?;
        if store.job(job.id).is_some() {
            return Err(BackendError::Message(format!("job {} already exists", job.id)));
        }
        store.jobs.push(JobRecord {
            id: job.id,
            tests_repo: job.tests_repo.clone(),
            tests_repo_branch: job.tests_repo_branch.clone(),
            tests_plans: job.tests_plans.clone(),
            image_url: job.image_url.clone(),
            status: JobStatus::Pending,
            priority: job.priority,
            requester: job.requester.clone(),
            submitted_at,
            debug: job.debug,
        });
        Ok(())
    }

    pub fn job(&self, job_id: JobId) -> BackendResult<Option<JobRecord>> {
        Ok(self.lock()?.job(job_id).cloned())
    }

    pub fn tests_for_job(&self, job_id: JobId) -> BackendResult<Vec<TestRecord>> {
        Ok(self
            .lock()?
            .tests
            .iter()
            .filter(|test| test.job_id == job_id)
            .cloned()
            .collect())
    }

    pub fn test(&self, id: TestId) -> BackendResult<Option<TestRecord>> {
        Ok(self.lock()?.tests.iter().find(|test| test.id == id).cloned())
    }

    /// Push a test's heartbeat into the past.
    pub fn backdate_test(&self, id: TestId, by: Duration) -> BackendResult<()> {
        let mut store = self.lock()?;
        let test = store
            .test_mut(id)
            .ok_or_else(|| BackendError::Message(format!("test {id} not found")))?;
        let by = chrono::Duration::from_std(by)
            .map_err(|err| BackendError::Message(err.to_string()))?;
        test.updated_at -= by;
        Ok(())
    }

    /// Overwrite a test's state without checking the state graph.
    pub fn force_test_state(&self, id: TestId, state: TestState) -> BackendResult<()> {
        let mut store = self.lock()?;
        let test = store
            .test_mut(id)
            .ok_or_else(|| BackendError::Message(format!("test {id} not found")))?;
        test.state = state;
        test.updated_at = Utc::now();
        Ok(())
    }
}

fn check_edge(from: TestState, to: TestState) -> BackendResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BackendError::Message(format!(
            "invalid test transition {from} -> {to}"
        )))
    }
}

fn is_stale(test: &TestRecord, state: TestState, cutoff: DateTime<Utc>) -> bool {
    test.state == state && test.updated_at < cutoff
}

fn cutoff(inactive_for: Duration) -> BackendResult<DateTime<Utc>> {
    let inactive_for = chrono::Duration::from_std(inactive_for)
        .map_err(|err| BackendError::Message(err.to_string()))?;
    Ok(Utc::now() - inactive_for)
}

#[async_trait]
impl TestIntakeBackend for MemoryBackend {
    async fn new_job_ids(&self) -> BackendResult<Vec<JobId>> {
        let store = self.lock()?;
        let mut jobs: Vec<&JobRecord> = store
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .filter(|job| !store.tests.iter().any(|test| test.job_id == job.id))
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
        });
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    async fn job_source(&self, job_id: JobId) -> BackendResult<JobSource> {
        let store = self.lock()?;
        let job = store.job(job_id).ok_or(BackendError::JobNotFound(job_id))?;
        Ok(JobSource {
            job_id,
            tests_repo: job.tests_repo.clone(),
            tests_repo_branch: job.tests_repo_branch.clone(),
            tests_plans: job.tests_plans.clone(),
        })
    }

    async fn insert_tests(&self, job_id: JobId, tests: &[NewTest]) -> BackendResult<usize> {
        let mut store = self.lock()?;
        if store.job(job_id).is_none() {
            return Err(BackendError::JobNotFound(job_id));
        }
        if store.tests.iter().any(|test| test.job_id == job_id) {
            return Ok(0);
        }
        let now = Utc::now();
        for test in tests {
            store.next_test_id += 1;
            let id = TestId(store.next_test_id);
            store.tests.push(TestRecord {
                id,
                job_id,
                test_case: test.test_case.clone(),
                plan: test.plan.clone(),
                state: TestState::Requested,
                vnc_address: String::new(),
                results_url: String::new(),
                updated_at: now,
                tpm: test.tpm,
                commit_hash: String::new(),
            });
        }
        Ok(tests.len())
    }
}

#[async_trait]
impl JobStatusBackend for MemoryBackend {
    async fn jobs_with_status(
        &self,
        statuses: &[JobStatus],
    ) -> BackendResult<Vec<JobStatusEntry>> {
        let store = self.lock()?;
        let mut jobs: Vec<&JobRecord> = store
            .jobs
            .iter()
            .filter(|job| statuses.contains(&job.status))
            .collect();
        jobs.sort_by_key(|job| job.submitted_at);
        Ok(jobs
            .into_iter()
            .map(|job| JobStatusEntry {
                job_id: job.id,
                status: job.status,
            })
            .collect())
    }

    async fn test_states(&self, job_id: JobId) -> BackendResult<Vec<TestState>> {
        Ok(self
            .lock()?
            .tests
            .iter()
            .filter(|test| test.job_id == job_id)
            .map(|test| test.state)
            .collect())
    }

    async fn set_job_status(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> BackendResult<bool> {
        let mut store = self.lock()?;
        match store.jobs.iter_mut().find(|job| job.id == job_id) {
            Some(job) if job.status == from => {
                job.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl StalenessBackend for MemoryBackend {
    async fn stale_test_ids(
        &self,
        state: TestState,
        inactive_for: Duration,
    ) -> BackendResult<Vec<TestId>> {
        let cutoff = cutoff(inactive_for)?;
        Ok(self
            .lock()?
            .tests
            .iter()
            .filter(|test| is_stale(test, state, cutoff))
            .map(|test| test.id)
            .collect())
    }

    async fn reset_stale_tests(
        &self,
        ids: &[TestId],
        state: TestState,
        inactive_for: Duration,
    ) -> BackendResult<usize> {
        let cutoff = cutoff(inactive_for)?;
        let mut store = self.lock()?;
        let mut reset = 0;
        for test in store.tests.iter_mut() {
            if ids.contains(&test.id) && is_stale(test, state, cutoff) {
                test.state = TestState::Requested;
                test.vnc_address.clear();
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl RetentionBackend for MemoryBackend {
    async fn delete_job(&self, job_id: JobId) -> BackendResult<RetentionResult> {
        let mut store = self.lock()?;
        let tests_before = store.tests.len();
        store.tests.retain(|test| test.job_id != job_id);
        let jobs_before = store.jobs.len();
        store.jobs.retain(|job| job.id != job_id);
        Ok(RetentionResult {
            deleted_tests: tests_before - store.tests.len(),
            deleted_jobs: jobs_before - store.jobs.len(),
        })
    }
}

#[async_trait]
impl TestLeaseBackend for MemoryBackend {
    async fn claim_test(
        &self,
        from: TestState,
        to: TestState,
        require_address: bool,
    ) -> BackendResult<Option<ClaimedTest>> {
        check_edge(from, to)?;
        let mut store = self.lock()?;

        let mut best: Option<(&TestRecord, &JobRecord)> = None;
        for test in &store.tests {
            if test.state != from || (require_address && test.vnc_address.is_empty()) {
                continue;
            }
            let Some(job) = store.job(test.job_id) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_test, best_job)) => {
                    (std::cmp::Reverse(job.priority), job.submitted_at, test.id)
                        < (
                            std::cmp::Reverse(best_job.priority),
                            best_job.submitted_at,
                            best_test.id,
                        )
                }
            };
            if better {
                best = Some((test, job));
            }
        }

        let Some((test, job)) = best else {
            return Ok(None);
        };
        let id = test.id;
        let tests_repo = job.tests_repo.clone();
        let tests_repo_branch = job.tests_repo_branch.clone();
        let image_url = job.image_url.clone();
        let priority = job.priority;

        let Some(test) = store.test_mut(id) else {
            return Ok(None);
        };
        test.state = to;
        test.updated_at = Utc::now();
        Ok(Some(ClaimedTest {
            test: test.clone(),
            tests_repo,
            tests_repo_branch,
            image_url,
            priority,
        }))
    }

    async fn transition(&self, id: TestId, from: TestState, to: TestState) -> BackendResult<bool> {
        check_edge(from, to)?;
        Ok(self.lock()?.update_if(id, from, |test| test.state = to))
    }

    async fn heartbeat(&self, id: TestId, expected: TestState) -> BackendResult<bool> {
        Ok(self.lock()?.update_if(id, expected, |_| {}))
    }

    async fn set_vnc_address(&self, id: TestId, address: &str) -> BackendResult<()> {
        let mut store = self.lock()?;
        if let Some(test) = store.test_mut(id) {
            test.vnc_address = address.to_string();
            test.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue(&self, id: TestId, from: TestState) -> BackendResult<bool> {
        check_edge(from, TestState::Requested)?;
        Ok(self.lock()?.update_if(id, from, |test| {
            test.state = TestState::Requested;
            test.vnc_address.clear();
        }))
    }

    async fn set_commit_hash(&self, id: TestId, commit_hash: &str) -> BackendResult<()> {
        let mut store = self.lock()?;
        if let Some(test) = store.test_mut(id) {
            test.commit_hash = commit_hash.to_string();
        }
        Ok(())
    }

    async fn finish_test(
        &self,
        id: TestId,
        results_url: &str,
        outcome: TestState,
    ) -> BackendResult<bool> {
        check_edge(TestState::Running, outcome)?;
        if !outcome.is_terminal() {
            return Err(BackendError::Message(format!(
                "test outcome must be terminal, got {outcome}"
            )));
        }
        Ok(self.lock()?.update_if(id, TestState::Running, |test| {
            test.results_url = results_url.to_string();
            test.state = outcome;
        }))
    }

    async fn test_state(&self, id: TestId) -> BackendResult<Option<TestState>> {
        Ok(self
            .lock()?
            .tests
            .iter()
            .find(|test| test.id == id)
            .map(|test| test.state))
    }
}
