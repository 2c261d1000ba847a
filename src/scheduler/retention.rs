//! Deletes artifacts and rows of expired jobs.

use std::time::Duration;

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::backends::RetentionBackend;
use crate::db::JobId;
use crate::storage::{StorageBackend, StorageResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionSummary {
    pub namespaces_removed: usize,
    pub jobs_deleted: usize,
    pub tests_deleted: usize,
    pub failures: usize,
}

/// Remove namespaces older than `age` from storage, then the rows of each
/// removed job (tests before the job).
#[instrument(skip_all, fields(age_secs = age.as_secs()))]
pub async fn enforce_retention<B>(
    backend: &B,
    storage: &dyn StorageBackend,
    age: Duration,
) -> StorageResult<RetentionSummary>
where
    B: RetentionBackend + ?Sized,
{
    let namespaces = storage.remove_older_than(age).await?;
    let mut summary = RetentionSummary {
        namespaces_removed: namespaces.len(),
        ..RetentionSummary::default()
    };

    for namespace in namespaces {
        let Ok(uuid) = Uuid::parse_str(&namespace) else {
            warn!(namespace = %namespace, "removed namespace is not a job uuid; no rows to delete");
            continue;
        };
        let job_id = JobId(uuid);
        match backend.delete_job(job_id).await {
            Ok(result) => {
                info!(
                    job_id = %job_id,
                    tests = result.deleted_tests,
                    jobs = result.deleted_jobs,
                    "deleted expired job"
                );
                summary.jobs_deleted += result.deleted_jobs;
                summary.tests_deleted += result.deleted_tests;
            }
            Err(err) => {
                // The namespace is already gone, so nothing retries this job.
                error!(job_id = %job_id, error = ?err, "failed to delete expired job rows");
                summary.failures += 1;
            }
        }
    }

    Ok(summary)
}
