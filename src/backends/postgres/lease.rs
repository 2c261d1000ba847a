use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

use super::{PostgresBackend, test_from_row};
use crate::backends::base::{
    BackendError, BackendResult, ClaimedTest, TestLeaseBackend, parse_test_state,
};
use crate::db::{TestId, TestState};

fn check_edge(from: TestState, to: TestState) -> BackendResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BackendError::Message(format!(
            "invalid test transition {from} -> {to}"
        )))
    }
}

#[async_trait]
impl TestLeaseBackend for PostgresBackend {
    #[instrument(skip_all, fields(%from, %to, require_address))]
    async fn claim_test(
        &self,
        from: TestState,
        to: TestState,
        require_address: bool,
    ) -> BackendResult<Option<ClaimedTest>> {
        check_edge(from, to)?;

        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT tests.id
                FROM tests
                JOIN jobs ON jobs.uuid = tests.uuid
                WHERE tests.state = $1
                  AND ($3 = FALSE OR tests.vnc_address <> '')
                ORDER BY jobs.priority DESC, jobs.submitted_at, tests.id
                LIMIT 1
                FOR UPDATE OF tests SKIP LOCKED
            )
            UPDATE tests
            SET state = $2, updated_at = NOW()
            FROM candidate, jobs
            WHERE tests.id = candidate.id
              AND tests.state = $1
              AND jobs.uuid = tests.uuid
            RETURNING tests.id, tests.uuid, tests.test_case, tests.plan, tests.state,
                      tests.vnc_address, tests.results_url, tests.updated_at, tests.tpm,
                      tests.commit_hash, jobs.tests_repo, jobs.tests_repo_branch,
                      jobs.image_url, jobs.priority
            "#,
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(require_address)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ClaimedTest {
            test: test_from_row(&row)?,
            tests_repo: row.try_get("tests_repo")?,
            tests_repo_branch: row.try_get("tests_repo_branch")?,
            image_url: row.try_get("image_url")?,
            priority: row.try_get("priority")?,
        }))
    }

    #[instrument(skip_all, fields(test_id = %id, %from, %to))]
    async fn transition(&self, id: TestId, from: TestState, to: TestState) -> BackendResult<bool> {
        check_edge(from, to)?;
        let result = sqlx::query(
            "UPDATE tests SET state = $3, updated_at = NOW() WHERE id = $1 AND state = $2",
        )
        .bind(id.0)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, id: TestId, expected: TestState) -> BackendResult<bool> {
        let result =
            sqlx::query("UPDATE tests SET updated_at = NOW() WHERE id = $1 AND state = $2")
                .bind(id.0)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_vnc_address(&self, id: TestId, address: &str) -> BackendResult<()> {
        sqlx::query("UPDATE tests SET vnc_address = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.0)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(test_id = %id, %from))]
    async fn requeue(&self, id: TestId, from: TestState) -> BackendResult<bool> {
        check_edge(from, TestState::Requested)?;
        let result = sqlx::query(
            r#"
            UPDATE tests
            SET state = $3, vnc_address = '', updated_at = NOW()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id.0)
        .bind(from.as_str())
        .bind(TestState::Requested.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_commit_hash(&self, id: TestId, commit_hash: &str) -> BackendResult<()> {
        sqlx::query("UPDATE tests SET commit_hash = $2 WHERE id = $1")
            .bind(id.0)
            .bind(commit_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(test_id = %id, %outcome))]
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
        let result = sqlx::query(
            r#"
            UPDATE tests
            SET results_url = $2, state = $3, updated_at = NOW()
            WHERE id = $1 AND state = $4
            "#,
        )
        .bind(id.0)
        .bind(results_url)
        .bind(outcome.as_str())
        .bind(TestState::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn test_state(&self, id: TestId) -> BackendResult<Option<TestState>> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM tests WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        state.as_deref().map(parse_test_state).transpose()
    }
}
