//! Postgres backend for the job/test store.

mod lease;
mod scheduler;

use sqlx::PgPool;
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::config::DatabaseConfig;
use crate::db::{self, JobId, NewJob, TestId, TestRecord};

use super::base::{BackendResult, parse_test_state};

/// Persist and lease jobs/tests in Postgres.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect, run migrations, and wrap the pool.
    pub async fn connect(config: &DatabaseConfig) -> BackendResult<Self> {
        let pool = db::connect(config).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Durably insert a job in `pending` status.
    ///
    /// This is the only write the intake API performs; everything after it is
    /// driven by the daemons.
    pub async fn insert_job(&self, job: &NewJob) -> BackendResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (uuid, tests_repo, tests_repo_branch, tests_plans, image_url, status,
                 priority, requester, debug)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.tests_repo)
        .bind(&job.tests_repo_branch)
        .bind(&job.tests_plans)
        .bind(&job.image_url)
        .bind(job.priority)
        .bind(&job.requester)
        .bind(job.debug)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All tests belonging to a job, in creation order.
    pub async fn tests_for_job(&self, job_id: JobId) -> BackendResult<Vec<TestRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, uuid, test_case, plan, state, vnc_address, results_url, updated_at,
                   tpm, commit_hash
            FROM tests
            WHERE uuid = $1
            ORDER BY id
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(test_from_row).collect()
    }
}

pub(super) fn test_from_row(row: &PgRow) -> BackendResult<TestRecord> {
    let state: String = row.try_get("state")?;
    Ok(TestRecord {
        id: TestId(row.try_get("id")?),
        job_id: JobId(row.try_get("uuid")?),
        test_case: row.try_get("test_case")?,
        plan: row.try_get("plan")?,
        state: parse_test_state(&state)?,
        vnc_address: row.try_get("vnc_address")?,
        results_url: row.try_get("results_url")?,
        updated_at: row.try_get("updated_at")?,
        tpm: row.try_get("tpm")?,
        commit_hash: row.try_get("commit_hash")?,
    })
}
