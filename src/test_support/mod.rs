//! Fixtures shared by unit tests.

pub(crate) mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::backends::{MemoryBackend, NewTest, TestIntakeBackend};
use crate::db::{JobId, NewJob, TestId, TestState};
use crate::git::{Checkout, GitError, RepoSource};
use crate::storage::{StorageBackend, StorageResult};

pub(crate) const STUB_COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

pub(crate) fn sample_job(priority: i32) -> NewJob {
    NewJob {
        id: JobId::new(),
        tests_repo: "https://example.com/acceptance-tests.git".to_string(),
        tests_repo_branch: "main".to_string(),
        tests_plans: vec!["tests/firefox-example/plans/regular.yaml".to_string()],
        image_url: "https://cdimage.ubuntu.com/daily-live/current/noble-desktop-amd64.iso"
            .to_string(),
        priority,
        requester: "qa@example.com".to_string(),
        debug: false,
    }
}

/// Insert a job with one test per entry of `states`, forced into that state.
pub(crate) async fn job_with_tests(
    backend: &MemoryBackend,
    job: NewJob,
    states: &[TestState],
) -> (JobId, Vec<TestId>) {
    backend.insert_job(&job).expect("insert job");
    let plan = job.tests_plans[0].clone();
    let tests: Vec<NewTest> = (0..states.len())
        .map(|index| NewTest {
            test_case: format!("case-{index}"),
            plan: plan.clone(),
            tpm: false,
        })
        .collect();
    backend
        .insert_tests(job.id, &tests)
        .await
        .expect("insert tests");

    let records = backend.tests_for_job(job.id).expect("tests");
    for (record, state) in records.iter().zip(states) {
        if *state != TestState::Requested {
            backend
                .force_test_state(record.id, *state)
                .expect("force state");
        }
    }
    (job.id, records.into_iter().map(|record| record.id).collect())
}

/// Storage double that records uploads and reports preset expired namespaces.
#[derive(Clone, Default)]
pub(crate) struct RecordingStorage {
    pub expired: Arc<Mutex<Vec<String>>>,
    pub uploads: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
    pub removal_ages: Arc<Mutex<Vec<Duration>>>,
}

#[async_trait]
impl StorageBackend for RecordingStorage {
    async fn upload(&self, namespace: &str, path: &str, data: Vec<u8>) -> StorageResult<String> {
        self.uploads.lock().expect("uploads poisoned").push((
            namespace.to_string(),
            path.to_string(),
            data,
        ));
        Ok(format!("http://artifacts:8080/{namespace}/{path}"))
    }

    async fn remove_older_than(&self, age: Duration) -> StorageResult<Vec<String>> {
        self.removal_ages
            .lock()
            .expect("removal ages poisoned")
            .push(age);
        Ok(std::mem::take(
            &mut *self.expired.lock().expect("expired poisoned"),
        ))
    }
}

/// Serves prepared directories instead of cloning.
#[derive(Default)]
pub(crate) struct StubRepos {
    pub files: HashMap<String, Vec<(&'static str, &'static str)>>,
    pub checkouts: Arc<Mutex<Vec<String>>>,
}

impl StubRepos {
    pub fn with_repo(mut self, repo: &str, files: Vec<(&'static str, &'static str)>) -> Self {
        self.files.insert(repo.to_string(), files);
        self
    }
}

#[async_trait]
impl RepoSource for StubRepos {
    async fn checkout(&self, repo: &str, _branch: &str) -> Result<Checkout, GitError> {
        self.checkouts
            .lock()
            .expect("checkouts poisoned")
            .push(repo.to_string());
        let files = self.files.get(repo).ok_or_else(|| {
            GitError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "repository not found",
            ))
        })?;
        let dir = TempDir::new()?;
        for (path, contents) in files {
            let path = dir.path().join(path);
            std::fs::create_dir_all(path.parent().expect("parent"))?;
            std::fs::write(path, contents)?;
        }
        Ok(Checkout::from_dir(dir, STUB_COMMIT))
    }
}
