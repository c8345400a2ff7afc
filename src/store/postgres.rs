//! Postgres store.
//!
//! Claims and completions run as a single conditional UPDATE inside a
//! transaction: the write matches rows on (id, version) and commits only
//! when the whole batch matched, so a lost race surfaces as a rollback
//! plus `OptimisticConflict` and never as a partial claim.
//!
//! Every logical operation checks a connection out of the pool for just
//! that operation. Nothing is held across a sleep, and concurrent
//! claimers read the freshest version tokens.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{ItemOutcome, ProcessState, Run, RunId, WorkItem, WorkItemId};

use super::Store;

use async_trait::async_trait;

/// Postgres-backed [`Store`]. Owns the connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to Postgres and create the schema if it does not exist.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            "
            CREATE TABLE IF NOT EXISTS work_items (
                id      UUID PRIMARY KEY,
                name    TEXT NOT NULL,
                state   SMALLINT NOT NULL DEFAULT 0,
                version BIGINT NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_pending
                ON work_items (id) WHERE state = 0;

            CREATE TABLE IF NOT EXISTS runs (
                id          UUID PRIMARY KEY,
                label       TEXT NOT NULL,
                correlation UUID NOT NULL,
                started_at  TIMESTAMPTZ NOT NULL,
                ended_at    TIMESTAMPTZ,
                status      SMALLINT NOT NULL DEFAULT 0,
                version     BIGINT NOT NULL DEFAULT 0
            );
            ",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Simple health check.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_run(&self, label: &str) -> Result<Run> {
        let run = Run::new(label);
        sqlx::query(
            "INSERT INTO runs (id, label, correlation, started_at, ended_at, status, version)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.id.0)
        .bind(&run.label)
        .bind(run.correlation)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.state.as_i16())
        .bind(run.version)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    async fn update_run(&self, run: &Run) -> Result<Run> {
        let rows_affected = sqlx::query(
            "UPDATE runs
             SET label = $1, started_at = $2, ended_at = $3, status = $4,
                 version = version + 1
             WHERE id = $5 AND version = $6",
        )
        .bind(&run.label)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.state.as_i16())
        .bind(run.id.0)
        .bind(run.version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Distinguish a lost race from a missing row; the latter is a
            // logical failure callers must not retry.
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM runs WHERE id = $1")
                .bind(run.id.0)
                .fetch_optional(&self.pool)
                .await?;
            return match exists {
                Some(_) => Err(Error::OptimisticConflict),
                None => Err(Error::NotFound(format!("run {}", run.id))),
            };
        }

        let mut updated = run.clone();
        updated.version += 1;
        Ok(updated)
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT id, label, correlation, started_at, ended_at, status, version
             FROM runs WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("run {id}")))?
            .try_into_run()
    }

    async fn clear_worklist(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM work_items")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_work_items(&self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = names.iter().map(|_| Uuid::new_v4()).collect();
        sqlx::query(
            "INSERT INTO work_items (id, name, state, version)
             SELECT id, name, 0, 0
             FROM unnest($1::uuid[], $2::text[]) AS chunk(id, name)",
        )
        .bind(&ids)
        .bind(names)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT id, name, state, version FROM work_items
             WHERE state = $1 LIMIT $2",
        )
        .bind(ProcessState::Pending.as_i16())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into_item()).collect()
    }

    async fn try_claim(&self, items: &[WorkItem]) -> Result<Vec<WorkItem>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = items.iter().map(|i| i.id.0).collect();
        let versions: Vec<i64> = items.iter().map(|i| i.version).collect();

        let mut tx = self.pool.begin().await?;
        let rows_affected = sqlx::query(
            "UPDATE work_items w
             SET state = $3, version = w.version + 1
             FROM unnest($1::uuid[], $2::bigint[]) AS batch(id, version)
             WHERE w.id = batch.id AND w.version = batch.version AND w.state = $4",
        )
        .bind(&ids)
        .bind(&versions)
        .bind(ProcessState::Claimed.as_i16())
        .bind(ProcessState::Pending.as_i16())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected != items.len() as u64 {
            tx.rollback().await?;
            return Err(Error::OptimisticConflict);
        }
        tx.commit().await?;

        Ok(items
            .iter()
            .map(|i| {
                let mut claimed = i.clone();
                claimed.state = ProcessState::Claimed;
                claimed.version += 1;
                claimed
            })
            .collect())
    }

    async fn mark_terminal(&self, outcomes: &[(WorkItem, ItemOutcome)]) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = outcomes.iter().map(|(i, _)| i.id.0).collect();
        let versions: Vec<i64> = outcomes.iter().map(|(i, _)| i.version).collect();
        let states: Vec<i16> = outcomes
            .iter()
            .map(|(_, o)| o.terminal_state().as_i16())
            .collect();

        let mut tx = self.pool.begin().await?;
        let rows_affected = sqlx::query(
            "UPDATE work_items w
             SET state = batch.next_state, version = w.version + 1
             FROM unnest($1::uuid[], $2::bigint[], $3::smallint[])
                 AS batch(id, version, next_state)
             WHERE w.id = batch.id AND w.version = batch.version AND w.state = $4",
        )
        .bind(&ids)
        .bind(&versions)
        .bind(&states)
        .bind(ProcessState::Claimed.as_i16())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected != outcomes.len() as u64 {
            tx.rollback().await?;
            return Err(Error::OptimisticConflict);
        }
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    label: String,
    correlation: Uuid,
    started_at: chrono::DateTime<chrono::Utc>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    status: i16,
    version: i64,
}

impl RunRow {
    fn try_into_run(self) -> Result<Run> {
        Ok(Run {
            id: RunId(self.id),
            label: self.label,
            correlation: self.correlation,
            started_at: self.started_at,
            ended_at: self.ended_at,
            state: crate::model::RunState::from_i16(self.status)?,
            version: self.version,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    name: String,
    state: i16,
    version: i64,
}

impl WorkItemRow {
    fn try_into_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkItemId(self.id),
            name: self.name,
            state: ProcessState::from_i16(self.state)?,
            version: self.version,
        })
    }
}
