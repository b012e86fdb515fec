use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::models::{Chain, ChainRun, ChainStep, ChainWithSteps, RunWithStepRuns, StepRun};
use crate::repo::{ChainChanges, ChainRepo, RepoError, StepRunChanges};

const CHAIN_COLUMNS: &str =
    "id, tenant_id, name, description, trigger_event, is_active, created_at, updated_at";

const STEP_COLUMNS: &str = r#"id, chain_id, step_order, webhook_id, name, description,
       request_params, on_success, on_failure, max_retries, delay_seconds,
       created_at, updated_at"#;

const RUN_COLUMNS: &str = r#"id, chain_id, tenant_id, status, trigger_event, trigger_data,
       current_step, total_steps, started_at, completed_at, last_error,
       created_at, updated_at"#;

const STEP_RUN_COLUMNS: &str = r#"id, run_id, step_id, step_order, status, request_payload,
       response_code, response_body, attempt_count, last_error,
       started_at, completed_at, created_at, updated_at"#;

/// Chains, steps, runs and step runs stored in Postgres.
#[derive(Clone)]
pub struct PgChainRepo {
    pool: PgPool,
}

impl PgChainRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChainRepo for PgChainRepo {
    async fn create_chain_with_steps(
        &self,
        chain: &Chain,
        steps: &[ChainStep],
    ) -> Result<(), RepoError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO execution_chains
                (id, tenant_id, name, description, trigger_event, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(chain.id)
        .bind(&chain.tenant_id)
        .bind(&chain.name)
        .bind(&chain.description)
        .bind(&chain.trigger_event)
        .bind(chain.is_active)
        .bind(chain.created_at)
        .bind(chain.updated_at)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO execution_chain_steps
                    (id, chain_id, step_order, webhook_id, name, description,
                     request_params, on_success, on_failure, max_retries, delay_seconds,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(step.id)
            .bind(step.chain_id)
            .bind(step.step_order)
            .bind(step.webhook_id)
            .bind(&step.name)
            .bind(&step.description)
            .bind(&step.request_params)
            .bind(step.on_success)
            .bind(step.on_failure)
            .bind(step.max_retries)
            .bind(step.delay_seconds)
            .bind(step.created_at)
            .bind(step.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainWithSteps>, RepoError> {
        let chain = sqlx::query_as::<_, Chain>(&format!(
            "SELECT {CHAIN_COLUMNS} FROM execution_chains WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(chain) = chain else {
            return Ok(None);
        };

        let steps = sqlx::query_as::<_, ChainStep>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM execution_chain_steps
            WHERE chain_id = $1
            ORDER BY step_order
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(ChainWithSteps { chain, steps }))
    }

    async fn list_chains(
        &self,
        tenant_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<Chain>, i64), RepoError> {
        let rows = sqlx::query_as::<_, Chain>(&format!(
            r#"
            SELECT {CHAIN_COLUMNS}
            FROM execution_chains
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(tenant_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM execution_chains WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;

        Ok((rows, total))
    }

    async fn get_chains_by_trigger(
        &self,
        tenant_id: &str,
        event: &str,
    ) -> Result<Vec<Chain>, RepoError> {
        let rows = sqlx::query_as::<_, Chain>(&format!(
            r#"
            SELECT {CHAIN_COLUMNS}
            FROM execution_chains
            WHERE tenant_id = $1 AND trigger_event = $2 AND is_active = true
            ORDER BY created_at
            "#
        ))
        .bind(tenant_id)
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_chain(&self, id: Uuid, changes: ChainChanges) -> Result<bool, RepoError> {
        if changes.is_empty() {
            return Ok(false);
        }

        let mut qb = QueryBuilder::new("UPDATE execution_chains SET ");
        let mut set = qb.separated(", ");

        if let Some(value) = changes.name {
            set.push("name = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.description {
            set.push("description = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.is_active {
            set.push("is_active = ").push_bind_unseparated(value);
        }
        set.push("updated_at = now()");

        qb.push(" WHERE id = ").push_bind(id);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_chain(&self, id: Uuid) -> Result<bool, RepoError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM execution_chain_step_runs
            WHERE run_id IN (SELECT id FROM execution_chain_runs WHERE chain_id = $1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM execution_chain_runs WHERE chain_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM execution_chain_steps WHERE chain_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM execution_chains WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: &ChainRun) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO execution_chain_runs
                (id, chain_id, tenant_id, status, trigger_event, trigger_data,
                 current_step, total_steps, started_at, completed_at, last_error,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(run.chain_id)
        .bind(&run.tenant_id)
        .bind(run.status)
        .bind(&run.trigger_event)
        .bind(&run.trigger_data)
        .bind(run.current_step)
        .bind(run.total_steps)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.last_error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunWithStepRuns>, RepoError> {
        let run = sqlx::query_as::<_, ChainRun>(&format!(
            "SELECT {RUN_COLUMNS} FROM execution_chain_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(run) = run else {
            return Ok(None);
        };

        let step_runs = sqlx::query_as::<_, StepRun>(&format!(
            r#"
            SELECT {STEP_RUN_COLUMNS}
            FROM execution_chain_step_runs
            WHERE run_id = $1
            ORDER BY step_order
            "#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(RunWithStepRuns { run, step_runs }))
    }

    async fn list_runs(
        &self,
        chain_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<ChainRun>, i64), RepoError> {
        let rows = sqlx::query_as::<_, ChainRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM execution_chain_runs
            WHERE chain_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#
        ))
        .bind(chain_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM execution_chain_runs WHERE chain_id = $1")
                .bind(chain_id)
                .fetch_one(&self.pool)
                .await?;

        Ok((rows, total))
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        status: crate::models::RunStatus,
    ) -> Result<(), RepoError> {
        let completed_at = status.is_terminal().then(Utc::now);
        sqlx::query(
            r#"
            UPDATE execution_chain_runs
            SET status = $1,
                completed_at = COALESCE($2, completed_at),
                updated_at = now()
            WHERE id = $3
            "#,
        )
        .bind(status)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run_current_step(&self, id: Uuid, current_step: i32) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE execution_chain_runs SET current_step = $1, updated_at = now() WHERE id = $2",
        )
        .bind(current_step)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_run_error(&self, id: Uuid, last_error: &str) -> Result<(), RepoError> {
        sqlx::query(
            "UPDATE execution_chain_runs SET last_error = $1, updated_at = now() WHERE id = $2",
        )
        .bind(last_error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_step_run(&self, step_run: &StepRun) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO execution_chain_step_runs
                (id, run_id, step_id, step_order, status, request_payload,
                 response_code, response_body, attempt_count, last_error,
                 started_at, completed_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(step_run.id)
        .bind(step_run.run_id)
        .bind(step_run.step_id)
        .bind(step_run.step_order)
        .bind(step_run.status)
        .bind(&step_run.request_payload)
        .bind(step_run.response_code)
        .bind(&step_run.response_body)
        .bind(step_run.attempt_count)
        .bind(&step_run.last_error)
        .bind(step_run.started_at)
        .bind(step_run.completed_at)
        .bind(step_run.created_at)
        .bind(step_run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_step_run(&self, id: Uuid, changes: StepRunChanges) -> Result<(), RepoError> {
        let mut qb = QueryBuilder::new("UPDATE execution_chain_step_runs SET ");
        let mut set = qb.separated(", ");

        if let Some(value) = changes.status {
            set.push("status = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.request_payload {
            set.push("request_payload = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.response_code {
            set.push("response_code = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.response_body {
            set.push("response_body = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.attempt_count {
            set.push("attempt_count = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.last_error {
            set.push("last_error = ").push_bind_unseparated(value);
        }
        if let Some(value) = changes.completed_at {
            set.push("completed_at = ").push_bind_unseparated(value);
        }
        set.push("updated_at = now()");

        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}
