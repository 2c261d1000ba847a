//! Scheduler daemon: expands jobs, aggregates status, reclaims stale tests
//! and enforces artifact retention.

mod aggregate;
mod intake;
mod retention;
mod staleness;
mod task;

pub use aggregate::{aggregate_job_status, job_status_for};
pub use intake::{ExpandError, IntakeSummary, PlanSource, RepoPlans, expand_new_jobs};
pub use retention::{RetentionSummary, enforce_retention};
pub use staleness::{RECLAIMABLE_STATES, reset_stale_tests};
pub use task::{SchedulerBackend, SchedulerTask};
