//! Postgres-backed run store.
//!
//! ## Concurrency
//!
//! - Claims lock candidate `job` rows with `FOR UPDATE OF j SKIP LOCKED`, so two
//!   servers never claim the same due job. A partial unique index allows at
//!   most one `running` run per job as a second line; a claim that loses to
//!   it skips the job (`ON CONFLICT DO NOTHING`) rather than failing.
//! - Every transition is one `UPDATE ... WHERE private_id = $1 AND
//!   status = 'running' RETURNING ...`. The first committer wins; a concurrent
//!   loser re-evaluates the predicate after the winner commits and matches
//!   nothing.
//! - All timestamps come from `NOW()` (transaction start), never from the
//!   caller.
//!
//! ## Error mapping
//!
//! | sqlx error | SQLSTATE | FaultClass |
//! |---|---|---|
//! | Database | `40001` | `SerializationConflict` |
//! | Database | `40P01` | `Deadlock` |
//! | Database | `08xxx` | `ConnectionLost` |
//! | Io / PoolTimedOut | n/a | `ConnectionLost` |
//! | anything else | any | `Other` |
//!
//! ## Runtime
//!
//! `RunStore` is synchronous. The store captures a tokio runtime [`Handle`]
//! and blocks on it, so it must be called from threads that are not
//! themselves driving that runtime (worker threads, `spawn_blocking`).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{info, warn};

use jobrun_core::{FaultClass, JobRef, Run, RunError, RunId, RunStatus, ServerId, StoreFault};

use super::store::{RunStore, RunTransition, RunTx};

const OP_CONNECT: &str = "postgres_run_store.connect";
const OP_MIGRATE: &str = "postgres_run_store.migrate";
const OP_BEGIN: &str = "postgres_run_store.begin";
const OP_COMMIT: &str = "postgres_run_store.commit";
const OP_CLAIM: &str = "postgres_run_store.claim_due_jobs";
const OP_TRANSITION: &str = "postgres_run_store.transition_run";
const OP_SET_NEXT: &str = "postgres_run_store.set_next_scheduled_run";
const OP_INTERRUPT: &str = "postgres_run_store.interrupt_stale_runs";
const OP_LOOKUP: &str = "postgres_run_store.lookup_run";
const OP_DELETE: &str = "postgres_run_store.delete_run";
const OP_UPSERT_JOB: &str = "postgres_run_store.upsert_job";

const RUN_COLUMNS: &str = "private_id, job_plugin_id, job_name, server_id, completed_count, \
     total_count, status, create_time, update_time, end_time";

// About 6000 years. `NOW()` minus this stays inside the timestamptz range,
// and no real run was updated before it.
const MAX_STALE_THRESHOLD_SECS: i64 = 6_000 * 31_557_600;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job (
        plugin_id          TEXT        NOT NULL,
        name               TEXT        NOT NULL,
        next_scheduled_run TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (plugin_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_run (
        private_id      UUID        PRIMARY KEY DEFAULT gen_random_uuid(),
        job_plugin_id   TEXT        NOT NULL,
        job_name        TEXT        NOT NULL,
        server_id       TEXT        NOT NULL CHECK (server_id <> ''),
        completed_count INTEGER     NOT NULL DEFAULT 0 CHECK (completed_count >= 0),
        total_count     INTEGER     NOT NULL DEFAULT 0 CHECK (total_count >= 0),
        status          TEXT        NOT NULL DEFAULT 'running'
                        CHECK (status IN ('running', 'completed', 'failed', 'interrupted')),
        create_time     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        update_time     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        end_time        TIMESTAMPTZ,
        FOREIGN KEY (job_plugin_id, job_name) REFERENCES job (plugin_id, name) ON DELETE CASCADE,
        CONSTRAINT job_run_end_time_iff_final CHECK ((end_time IS NULL) = (status = 'running'))
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS job_run_one_running_per_job
        ON job_run (job_plugin_id, job_name)
        WHERE status = 'running'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS job_run_running_update_time
        ON job_run (update_time)
        WHERE status = 'running'
    "#,
];

/// Postgres-backed run store.
#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Connect a pool of at most `max_connections` on `handle`.
    pub fn connect(
        database_url: &str,
        max_connections: u32,
        handle: Handle,
    ) -> Result<Self, RunError> {
        let pool = handle
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error(OP_CONNECT, e))?;
        Ok(Self::new(pool, handle))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `job` and `job_run` tables if absent.
    pub fn migrate(&self) -> Result<(), RunError> {
        self.handle.block_on(async {
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error(OP_MIGRATE, e))?;
            }
            Ok::<_, RunError>(())
        })?;
        info!("run store schema ready");
        Ok(())
    }

    /// Register a job definition or move its next scheduled run.
    pub fn upsert_job(&self, job: &JobRef) -> Result<(), RunError> {
        self.handle
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO job (plugin_id, name, next_scheduled_run)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (plugin_id, name)
                    DO UPDATE SET next_scheduled_run = EXCLUDED.next_scheduled_run
                    "#,
                )
                .bind(&job.plugin_id)
                .bind(&job.name)
                .bind(job.next_scheduled_run)
                .execute(&*self.pool),
            )
            .map_err(|e| map_sqlx_error(OP_UPSERT_JOB, e))?;
        Ok(())
    }
}

impl RunStore for PostgresRunStore {
    fn transact<T, F>(&self, work: F) -> Result<T, RunError>
    where
        F: FnOnce(&mut dyn RunTx) -> Result<T, RunError>,
    {
        let tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error(OP_BEGIN, e))?;

        let mut run_tx = PgRunTx {
            tx,
            handle: &self.handle,
        };

        match work(&mut run_tx) {
            Ok(value) => {
                self.handle
                    .block_on(run_tx.tx.commit())
                    .map_err(|e| map_sqlx_error(OP_COMMIT, e))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.handle.block_on(run_tx.tx.rollback()) {
                    warn!(error = %rollback_err, "rollback failed; connection will be discarded");
                }
                Err(err)
            }
        }
    }

    fn lookup_run(&self, run_id: RunId) -> Result<Option<Run>, RunError> {
        let row = self
            .handle
            .block_on(
                sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM job_run WHERE private_id = $1"))
                    .bind(*run_id.as_uuid())
                    .fetch_optional(&*self.pool),
            )
            .map_err(|e| map_sqlx_error(OP_LOOKUP, e))?;
        row.map(|r| decode_run(OP_LOOKUP, &r)).transpose()
    }
}

struct PgRunTx<'h> {
    tx: Transaction<'static, Postgres>,
    handle: &'h Handle,
}

impl PgRunTx<'_> {
    fn fetch_runs(
        &mut self,
        op: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Run>, RunError> {
        let conn: &mut PgConnection = &mut self.tx;
        let rows = self
            .handle
            .block_on(query.fetch_all(conn))
            .map_err(|e| map_sqlx_error(op, e))?;
        rows.iter().map(|r| decode_run(op, r)).collect()
    }
}

impl RunTx for PgRunTx<'_> {
    fn claim_due_jobs(&mut self, server_id: &ServerId, limit: u32) -> Result<Vec<Run>, RunError> {
        let sql = claim_sql();
        let query = sqlx::query(&sql)
            .bind(server_id.as_str())
            .bind(i64::from(limit));
        self.fetch_runs(OP_CLAIM, query)
    }

    fn transition_run(
        &mut self,
        run_id: RunId,
        transition: RunTransition,
    ) -> Result<Vec<Run>, RunError> {
        let sql = match transition {
            RunTransition::Progress { .. } => format!(
                r#"
                UPDATE job_run
                SET completed_count = $2, total_count = $3, update_time = NOW()
                WHERE private_id = $1 AND status = 'running'
                RETURNING {RUN_COLUMNS}
                "#
            ),
            RunTransition::Complete | RunTransition::Fail => format!(
                r#"
                UPDATE job_run
                SET status = $2, end_time = NOW(), update_time = NOW()
                WHERE private_id = $1 AND status = 'running'
                RETURNING {RUN_COLUMNS}
                "#
            ),
        };
        let query = sqlx::query(&sql).bind(*run_id.as_uuid());
        let query = match transition {
            RunTransition::Progress { completed, total } => query
                .bind(count_param(OP_TRANSITION, completed)?)
                .bind(count_param(OP_TRANSITION, total)?),
            RunTransition::Complete => query.bind(RunStatus::Completed.as_str()),
            RunTransition::Fail => query.bind(RunStatus::Failed.as_str()),
        };
        self.fetch_runs(OP_TRANSITION, query)
    }

    fn set_next_scheduled_run(
        &mut self,
        plugin_id: &str,
        job_name: &str,
        next_run_in_secs: i64,
    ) -> Result<Vec<JobRef>, RunError> {
        let conn: &mut PgConnection = &mut self.tx;
        let rows = self
            .handle
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE job
                    SET next_scheduled_run = NOW() + ($3::bigint * INTERVAL '1 second')
                    WHERE plugin_id = $1 AND name = $2
                    RETURNING plugin_id, name, next_scheduled_run
                    "#,
                )
                .bind(plugin_id)
                .bind(job_name)
                .bind(next_run_in_secs)
                .fetch_all(conn),
            )
            .map_err(|e| map_sqlx_error(OP_SET_NEXT, e))?;

        rows.iter()
            .map(|row| -> Result<JobRef, sqlx::Error> {
                Ok(JobRef {
                    plugin_id: row.try_get("plugin_id")?,
                    name: row.try_get("name")?,
                    next_scheduled_run: row.try_get("next_scheduled_run")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error(OP_SET_NEXT, e))
    }

    fn interrupt_stale_runs(
        &mut self,
        threshold_secs: i64,
        server_id: Option<&ServerId>,
    ) -> Result<Vec<Run>, RunError> {
        let sql = format!(
            r#"
            UPDATE job_run
            SET status = 'interrupted', end_time = NOW(), update_time = NOW()
            WHERE status = 'running'
              AND update_time < NOW() - ($1::bigint * INTERVAL '1 second')
              AND ($2::text IS NULL OR server_id = $2)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(threshold_secs.min(MAX_STALE_THRESHOLD_SECS))
            .bind(server_id.map(ServerId::as_str));
        let mut runs = self.fetch_runs(OP_INTERRUPT, query)?;
        runs.sort_by_key(|r| (r.create_time, r.private_id));
        Ok(runs)
    }

    fn lookup_run(&mut self, run_id: RunId) -> Result<Option<Run>, RunError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM job_run WHERE private_id = $1");
        let query = sqlx::query(&sql).bind(*run_id.as_uuid());
        Ok(self.fetch_runs(OP_LOOKUP, query)?.into_iter().next())
    }

    fn delete_run(&mut self, run_id: RunId) -> Result<u64, RunError> {
        let conn: &mut PgConnection = &mut self.tx;
        let result = self
            .handle
            .block_on(
                sqlx::query("DELETE FROM job_run WHERE private_id = $1")
                    .bind(*run_id.as_uuid())
                    .execute(conn),
            )
            .map_err(|e| map_sqlx_error(OP_DELETE, e))?;
        Ok(result.rows_affected())
    }
}

/// Claim statement. A job whose run another transaction inserted after this
/// statement's snapshot trips the one-running-run index; `ON CONFLICT` skips
/// it instead of failing the whole claim.
fn claim_sql() -> String {
    format!(
        r#"
        WITH due AS (
            SELECT j.plugin_id, j.name
            FROM job j
            WHERE j.next_scheduled_run <= NOW()
              AND NOT EXISTS (
                  SELECT 1 FROM job_run r
                  WHERE r.job_plugin_id = j.plugin_id
                    AND r.job_name = j.name
                    AND r.status = 'running'
              )
            ORDER BY j.next_scheduled_run, j.plugin_id, j.name
            LIMIT $2
            FOR UPDATE OF j SKIP LOCKED
        )
        INSERT INTO job_run (job_plugin_id, job_name, server_id)
        SELECT plugin_id, name, $1 FROM due
        ON CONFLICT (job_plugin_id, job_name) WHERE status = 'running' DO NOTHING
        RETURNING {RUN_COLUMNS}
        "#
    )
}

fn count_param(op: &'static str, count: u32) -> Result<i32, RunError> {
    i32::try_from(count)
        .map_err(|_| RunError::invalid_parameter(op, format!("count {count} out of range")))
}

#[derive(Debug)]
struct RunRow {
    private_id: uuid::Uuid,
    job_plugin_id: String,
    job_name: String,
    server_id: String,
    completed_count: i32,
    total_count: i32,
    status: String,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for RunRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RunRow {
            private_id: row.try_get("private_id")?,
            job_plugin_id: row.try_get("job_plugin_id")?,
            job_name: row.try_get("job_name")?,
            server_id: row.try_get("server_id")?,
            completed_count: row.try_get("completed_count")?,
            total_count: row.try_get("total_count")?,
            status: row.try_get("status")?,
            create_time: row.try_get("create_time")?,
            update_time: row.try_get("update_time")?,
            end_time: row.try_get("end_time")?,
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = String;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<RunStatus>()
            .map_err(|e| e.to_string())?;
        let count = |name: &str, v: i32| {
            u32::try_from(v).map_err(|_| format!("negative {name} {v}"))
        };
        Ok(Run {
            private_id: RunId::from_uuid(row.private_id),
            job_plugin_id: row.job_plugin_id,
            job_name: row.job_name,
            server_id: ServerId::from(row.server_id),
            completed_count: count("completed_count", row.completed_count)?,
            total_count: count("total_count", row.total_count)?,
            status,
            create_time: row.create_time,
            update_time: row.update_time,
            end_time: row.end_time,
        })
    }
}

fn decode_run(op: &'static str, row: &PgRow) -> Result<Run, RunError> {
    let row = RunRow::from_row(row).map_err(|e| map_sqlx_error(op, e))?;
    Run::try_from(row)
        .map_err(|msg| RunError::store(op, StoreFault::other(format!("corrupt job_run row: {msg}"))))
}

/// Classify a Postgres SQLSTATE into the retryable fault set.
pub fn classify_sqlstate(code: &str) -> FaultClass {
    match code {
        "40001" => FaultClass::SerializationConflict,
        "40P01" => FaultClass::Deadlock,
        c if c.starts_with("08") => FaultClass::ConnectionLost,
        _ => FaultClass::Other,
    }
}

fn map_sqlx_error(op: &'static str, err: sqlx::Error) -> RunError {
    let fault = match &err {
        sqlx::Error::Database(db_err) => {
            let class = db_err
                .code()
                .map(|code| classify_sqlstate(code.as_ref()))
                .unwrap_or(FaultClass::Other);
            StoreFault::new(class, format!("database error: {}", db_err.message()))
        }
        sqlx::Error::Io(e) => StoreFault::connection_lost(format!("io error: {e}")),
        sqlx::Error::PoolTimedOut => StoreFault::connection_lost("timed out acquiring a connection"),
        other => StoreFault::other(other.to_string()),
    };
    RunError::store(op, fault)
}
