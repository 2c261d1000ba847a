//! Postgres fixture for backend tests.
//!
//! Tests skip unless `VMTEST_TEST_DATABASE_URL` points at a disposable database.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use super::sample_job;
use crate::backends::PostgresBackend;
use crate::db::{self, JobId, TestId};

/// Connect to the test database, or `None` when it is not configured.
pub(crate) async fn setup_backend() -> Option<PostgresBackend> {
    let Ok(url) = std::env::var("VMTEST_TEST_DATABASE_URL") else {
        eprintln!("Skipping test: database not available");
        return None;
    };
    let pool = match PgPoolOptions::new().max_connections(2).connect(&url).await {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("Skipping test: database not available ({err})");
            return None;
        }
    };
    db::run_migrations(&pool).await.expect("run migrations");
    sqlx::query("TRUNCATE tests, jobs RESTART IDENTITY")
        .execute(&pool)
        .await
        .expect("truncate tables");
    Some(PostgresBackend::new(pool))
}

pub(crate) async fn insert_sample_job(backend: &PostgresBackend, priority: i32) -> JobId {
    let job = sample_job(priority);
    backend.insert_job(&job).await.expect("insert job");
    job.id
}

/// Push a test's heartbeat into the past.
pub(crate) async fn backdate_test(backend: &PostgresBackend, id: TestId, by: Duration) {
    sqlx::query("UPDATE tests SET updated_at = NOW() - make_interval(secs => $2) WHERE id = $1")
        .bind(id.0)
        .bind(by.as_secs_f64())
        .execute(backend.pool())
        .await
        .expect("backdate test");
}
