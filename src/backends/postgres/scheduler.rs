use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use super::PostgresBackend;
use crate::backends::base::{
    BackendError, BackendResult, JobSource, JobStatusBackend, JobStatusEntry, NewTest,
    RetentionBackend, RetentionResult, StalenessBackend, TestIntakeBackend, parse_job_status,
    parse_test_state,
};
use crate::db::{JobId, JobStatus, TestId, TestState};

#[async_trait]
impl TestIntakeBackend for PostgresBackend {
    async fn new_job_ids(&self) -> BackendResult<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT jobs.uuid
            FROM jobs
            WHERE jobs.status = $1
              AND NOT EXISTS (SELECT 1 FROM tests WHERE tests.uuid = jobs.uuid)
            ORDER BY jobs.priority DESC, jobs.submitted_at
            "#,
        )
        .bind(JobStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| JobId(row.get::<Uuid, _>("uuid")))
            .collect())
    }

    async fn job_source(&self, job_id: JobId) -> BackendResult<JobSource> {
        let row = sqlx::query(
            r#"
            SELECT tests_repo, tests_repo_branch, tests_plans
            FROM jobs
            WHERE uuid = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(BackendError::JobNotFound(job_id))?;

        Ok(JobSource {
            job_id,
            tests_repo: row.try_get("tests_repo")?,
            tests_repo_branch: row.try_get("tests_repo_branch")?,
            tests_plans: row.try_get("tests_plans")?,
        })
    }

    #[instrument(skip_all, fields(job_id = %job_id, tests = tests.len()))]
    async fn insert_tests(&self, job_id: JobId, tests: &[NewTest]) -> BackendResult<usize> {
        if tests.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        // Lock the parent row so two expansions of the same job serialize.
        let locked = sqlx::query("SELECT uuid FROM jobs WHERE uuid = $1 FOR UPDATE")
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(BackendError::JobNotFound(job_id));
        }

        let already_expanded: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tests WHERE uuid = $1)")
                .bind(job_id.0)
                .fetch_one(&mut *tx)
                .await?;
        if already_expanded {
            tx.commit().await?;
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO tests (uuid, test_case, plan, state, vnc_address, results_url, updated_at, tpm, commit_hash) ",
        );
        builder.push_values(tests.iter(), |mut row, test| {
            row.push_bind(job_id.0)
                .push_bind(&test.test_case)
                .push_bind(&test.plan)
                .push_bind(TestState::Requested.as_str())
                .push_bind("")
                .push_bind("")
                .push("NOW()")
                .push_bind(test.tpm)
                .push_bind("");
        });
        let inserted = builder.build().execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        Ok(inserted as usize)
    }
}

#[async_trait]
impl JobStatusBackend for PostgresBackend {
    async fn jobs_with_status(
        &self,
        statuses: &[JobStatus],
    ) -> BackendResult<Vec<JobStatusEntry>> {
        let statuses: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
        let rows = sqlx::query(
            r#"
            SELECT uuid, status
            FROM jobs
            WHERE status = ANY($1)
            ORDER BY submitted_at
            "#,
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(JobStatusEntry {
                    job_id: JobId(row.try_get("uuid")?),
                    status: parse_job_status(&status)?,
                })
            })
            .collect()
    }

    async fn test_states(&self, job_id: JobId) -> BackendResult<Vec<TestState>> {
        let states: Vec<String> = sqlx::query_scalar("SELECT state FROM tests WHERE uuid = $1")
            .bind(job_id.0)
            .fetch_all(&self.pool)
            .await?;

        states.iter().map(|state| parse_test_state(state)).collect()
    }

    #[instrument(skip_all, fields(job_id = %job_id, %from, %to))]
    async fn set_job_status(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> BackendResult<bool> {
        let result = sqlx::query("UPDATE jobs SET status = $3 WHERE uuid = $1 AND status = $2")
            .bind(job_id.0)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StalenessBackend for PostgresBackend {
    async fn stale_test_ids(
        &self,
        state: TestState,
        inactive_for: Duration,
    ) -> BackendResult<Vec<TestId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM tests
            WHERE state = $1
              AND updated_at < NOW() - make_interval(secs => $2)
            ORDER BY id
            "#,
        )
        .bind(state.as_str())
        .bind(inactive_for.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(TestId).collect())
    }

    #[instrument(skip_all, fields(%state, count = ids.len()))]
    async fn reset_stale_tests(
        &self,
        ids: &[TestId],
        state: TestState,
        inactive_for: Duration,
    ) -> BackendResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query(
            r#"
            UPDATE tests
            SET state = $4, vnc_address = ''
            WHERE id = ANY($1)
              AND state = $2
              AND updated_at < NOW() - make_interval(secs => $3)
            "#,
        )
        .bind(&ids)
        .bind(state.as_str())
        .bind(inactive_for.as_secs_f64())
        .bind(TestState::Requested.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl RetentionBackend for PostgresBackend {
    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn delete_job(&self, job_id: JobId) -> BackendResult<RetentionResult> {
        let mut tx = self.pool.begin().await?;
        let deleted_tests = sqlx::query("DELETE FROM tests WHERE uuid = $1")
            .bind(job_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let deleted_jobs = sqlx::query("DELETE FROM jobs WHERE uuid = $1")
            .bind(job_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(RetentionResult {
            deleted_tests: deleted_tests as usize,
            deleted_jobs: deleted_jobs as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;

    use super::*;
    use crate::test_support::postgres::{backdate_test, insert_sample_job, setup_backend};

    fn sample_tests() -> Vec<NewTest> {
        vec![
            NewTest {
                test_case: "Firefox-Example-Basic".to_string(),
                plan: "tests/firefox-example/plans/regular.yaml".to_string(),
                tpm: false,
            },
            NewTest {
                test_case: "Firefox-Example-New-Tab".to_string(),
                plan: "tests/firefox-example/plans/regular.yaml".to_string(),
                tpm: true,
            },
        ]
    }

    #[tokio::test]
    #[serial]
    async fn insert_tests_is_idempotent_per_job() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let job_id = insert_sample_job(&backend, 5).await;

        assert_eq!(backend.new_job_ids().await.expect("new jobs"), vec![job_id]);
        let first = backend
            .insert_tests(job_id, &sample_tests())
            .await
            .expect("first insert");
        let second = backend
            .insert_tests(job_id, &sample_tests())
            .await
            .expect("second insert");

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert!(backend.new_job_ids().await.expect("new jobs").is_empty());

        let tests = backend.tests_for_job(job_id).await.expect("tests");
        assert_eq!(tests.len(), 2);
        assert!(tests.iter().all(|test| test.state == TestState::Requested));
        assert!(tests.iter().all(|test| test.vnc_address.is_empty()));
    }

    #[tokio::test]
    #[serial]
    async fn failed_jobs_leave_intake() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let job_id = insert_sample_job(&backend, 0).await;

        assert!(
            backend
                .set_job_status(job_id, JobStatus::Pending, JobStatus::Fail)
                .await
                .expect("fail job")
        );

        assert!(backend.new_job_ids().await.expect("new jobs").is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn staleness_uses_store_clock() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let job_id = insert_sample_job(&backend, 0).await;
        backend
            .insert_tests(job_id, &sample_tests())
            .await
            .expect("insert tests");
        let tests = backend.tests_for_job(job_id).await.expect("tests");
        sqlx::query("UPDATE tests SET state = 'spawning', vnc_address = 'host:5901'")
            .execute(backend.pool())
            .await
            .expect("mark spawning");
        backdate_test(&backend, tests[0].id, Duration::from_secs(5 * 60)).await;

        let interval = Duration::from_secs(2 * 60);
        let stale = backend
            .stale_test_ids(TestState::Spawning, interval)
            .await
            .expect("stale ids");
        assert_eq!(stale, vec![tests[0].id]);

        let reset = backend
            .reset_stale_tests(&stale, TestState::Spawning, interval)
            .await
            .expect("reset");
        assert_eq!(reset, 1);

        let tests = backend.tests_for_job(job_id).await.expect("tests");
        assert_eq!(tests[0].state, TestState::Requested);
        assert_eq!(tests[0].vnc_address, "");
        assert_eq!(tests[1].state, TestState::Spawning);
    }

    #[tokio::test]
    #[serial]
    async fn delete_job_removes_tests_then_job() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let job_id = insert_sample_job(&backend, 0).await;
        backend
            .insert_tests(job_id, &sample_tests())
            .await
            .expect("insert tests");

        let result = backend.delete_job(job_id).await.expect("delete job");
        assert_eq!(
            result,
            RetentionResult {
                deleted_tests: 2,
                deleted_jobs: 1,
            }
        );
        assert!(matches!(
            backend.job_source(job_id).await,
            Err(BackendError::JobNotFound(_))
        ));
    }
}
