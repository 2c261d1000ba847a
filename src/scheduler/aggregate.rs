//! Projects test states onto job status.

use tracing::{debug, info, instrument};

use crate::backends::{BackendResult, JobStatusBackend};
use crate::db::{JobStatus, TestState};

/// Jobs whose status can still change.
const OPEN_STATUSES: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

/// Reduce a job's test states to its status, `None` when it has no tests.
///
/// Order-independent: any unfinished test keeps the job running; once all
/// tests are terminal any `fail` fails the job, otherwise it passed.
pub fn job_status_for(states: &[TestState]) -> Option<JobStatus> {
    if states.is_empty() {
        return None;
    }
    if states.iter().any(|state| !state.is_terminal()) {
        Some(JobStatus::Running)
    } else if states.contains(&TestState::Fail) {
        Some(JobStatus::Fail)
    } else {
        Some(JobStatus::Pass)
    }
}

/// Recompute the status of every pending or running job.
///
/// Returns how many jobs changed status.
#[instrument(skip_all)]
pub async fn aggregate_job_status<B>(backend: &B) -> BackendResult<usize>
where
    B: JobStatusBackend + ?Sized,
{
    let jobs = backend.jobs_with_status(&OPEN_STATUSES).await?;
    let mut updated = 0;
    for job in jobs {
        let states = backend.test_states(job.job_id).await?;
        let Some(status) = job_status_for(&states) else {
            continue;
        };
        if status == job.status {
            continue;
        }
        if backend
            .set_job_status(job.job_id, job.status, status)
            .await?
        {
            info!(job_id = %job.job_id, from = %job.status, to = %status, "job status changed");
            updated += 1;
        } else {
            debug!(job_id = %job.job_id, "job status changed concurrently");
        }
    }
    Ok(updated)
}
