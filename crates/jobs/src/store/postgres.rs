//! Postgres-backed job store.
//!
//! All jobs live in one table, `fhirq_jobs`. Claim-protocol transitions are
//! computed by the same [`Job`] methods the in-memory store uses, applied to rows
//! locked with `SELECT ... FOR UPDATE` inside a transaction.
//!
//! ## Atomicity
//!
//! | Operation | Guard |
//! |-----------|-------|
//! | `acquire` | per-queue `pg_advisory_xact_lock`, admission count and claims in one transaction |
//! | exclusive `enqueue` | advisory lock on `(queue_type, tenant_id)`, then an existence check |
//! | `heartbeat` | single conditional `UPDATE ... WHERE run_token = $2 AND status = 'running'` |
//! | `complete` / `fail` / `release` / cancel | row lock, transition in Rust, conditional write |
//!
//! Timestamps come from the database clock, so staleness is judged against one
//! clock for the whole fleet. They are read with `clock_timestamp()` after the
//! locks are held: `now()` is the transaction start and would backdate a lease
//! granted after waiting on a lock.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (connection, transaction rollback, resources, operator intervention) | `08*`, `40*`, `53*`, `57*`, `55P03` | `Unavailable` |
//! | Database (other) | Any other | `Storage` |
//! | PoolTimedOut / Io | N/A | `Unavailable` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::{Span, debug, info, instrument, warn};

use fhirq_core::{ExpectedVersion, GroupId, JobId, QueueType, RunToken, TenantId};

use super::{JobFilter, JobStore, JobStoreError, QueueStats};
use crate::admission::{AdmissionController, QueueLimits};
use crate::types::{
    AttemptRecord, ClaimTransition, CompleteOutcome, EnqueueRequest, FailOutcome, Failure,
    HeartbeatOutcome, Job, JobStatus, ReleaseOutcome, to_chrono,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS fhirq_jobs (
        id               UUID PRIMARY KEY,
        tenant_id        UUID NOT NULL,
        queue_type       TEXT NOT NULL,
        group_id         UUID NULL,
        status           TEXT NOT NULL
            CHECK (status IN ('queued', 'running', 'completed', 'failed', 'cancelled')),
        priority         INTEGER NULL,
        definition       JSONB NOT NULL,
        result           JSONB NULL,
        context          JSONB NULL,
        heartbeat_at     TIMESTAMPTZ NOT NULL,
        run_token        UUID NULL,
        retry_count      BIGINT NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        max_retry_count  BIGINT NOT NULL CHECK (max_retry_count >= 0),
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        version          BIGINT NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL,
        started_at       TIMESTAMPTZ NULL,
        completed_at     TIMESTAMPTZ NULL,
        history          JSONB NOT NULL DEFAULT '[]'::jsonb
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS fhirq_jobs_claim_idx
        ON fhirq_jobs (queue_type, status, (COALESCE(priority, 0)) DESC, heartbeat_at)
        WHERE status IN ('queued', 'running')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS fhirq_jobs_group_idx
        ON fhirq_jobs (group_id) WHERE group_id IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS fhirq_jobs_tenant_idx
        ON fhirq_jobs (tenant_id, created_at)
    "#,
];

const JOB_COLUMNS: &str = "id, tenant_id, queue_type, group_id, status, priority, definition, \
     result, context, heartbeat_at, run_token, retry_count, max_retry_count, cancel_requested, \
     version, created_at, started_at, completed_at, history";

/// Postgres-backed [`JobStore`].
///
/// `Send + Sync`; clone freely, the pool is shared.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    admission: AdmissionController,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, limits: Arc<dyn QueueLimits>) -> Self {
        Self {
            pool: Arc::new(pool),
            admission: AdmissionController::new(limits),
        }
    }

    /// Create the jobs table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        info!("job schema ready");
        Ok(())
    }

    async fn live_running(
        conn: &mut PgConnection,
        queue_type: &QueueType,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS live
            FROM fhirq_jobs
            WHERE queue_type = $1 AND status = 'running' AND heartbeat_at >= $2
            "#,
        )
        .bind(queue_type.to_string())
        .bind(cutoff)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("count_live_running", e))?;
        let live: i64 = row
            .try_get("live")
            .map_err(|e| JobStoreError::Serialization(format!("failed to read live count: {e}")))?;
        Ok(live.max(0) as usize)
    }

    async fn claim_candidates(
        conn: &mut PgConnection,
        queue_type: &QueueType,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM fhirq_jobs
            WHERE queue_type = $1
              AND (status = 'queued' OR (status = 'running' AND heartbeat_at < $2))
            ORDER BY COALESCE(priority, 0) DESC, heartbeat_at ASC, id ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(queue_type.to_string())
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("select_claim_candidates", e))?;
        decode_jobs(rows)
    }

    /// Lock one row for a transition. `None` when it does not exist.
    async fn lock_job(conn: &mut PgConnection, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fhirq_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    /// Run a run-token-fenced transition on a locked row and persist it if it changed.
    async fn transition<T>(
        &self,
        operation: &'static str,
        job_id: JobId,
        lost: T,
        apply: impl FnOnce(&mut Job, DateTime<Utc>) -> T + Send,
    ) -> Result<T, JobStoreError>
    where
        T: Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let Some(mut job) = Self::lock_job(&mut tx, job_id).await? else {
            debug!(job_id = %job_id, operation, "job missing, treating as lost");
            return Ok(lost);
        };
        let now = db_now(&mut tx).await?;
        let before = job.version;
        let outcome = apply(&mut job, now);
        if job.version != before {
            write_job(&mut tx, &job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, JobStoreError> {
        let ids = self.enqueue_batch(vec![request]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| JobStoreError::Storage("enqueue produced no job".to_string()))
    }

    #[instrument(skip(self, requests), fields(count = requests.len()), err)]
    async fn enqueue_batch(
        &self,
        requests: Vec<EnqueueRequest>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let now = db_now(&mut tx).await?;

        let mut pending: Vec<Job> = Vec::with_capacity(requests.len());
        for request in requests {
            if request.exclusive {
                check_exclusive(&mut tx, &pending, &request).await?;
            }
            pending.push(Job::new(request, now));
        }
        for job in &pending {
            insert_job(&mut tx, job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(pending.into_iter().map(|j| j.id).collect())
    }

    #[instrument(skip(self), fields(queue = %queue_type, claimed = tracing::field::Empty), err)]
    async fn acquire(
        &self,
        queue_type: &QueueType,
        max_count: usize,
        heartbeat_timeout: Duration,
    ) -> Result<Vec<Job>, JobStoreError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("acquire:{queue_type}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        let now = db_now(&mut tx).await?;
        let cutoff = stale_cutoff(now, heartbeat_timeout);
        let live = Self::live_running(&mut tx, queue_type, cutoff).await?;
        let wanted = max_count.min(self.admission.available_slots(queue_type, live));

        let mut claimed = Vec::new();
        while claimed.len() < wanted {
            let candidates =
                Self::claim_candidates(&mut tx, queue_type, cutoff, wanted - claimed.len()).await?;
            if candidates.is_empty() {
                break;
            }
            for mut job in candidates {
                let reclaim = job.status == JobStatus::Running;
                let transition = job.claim(now, RunToken::new());
                write_job(&mut tx, &job).await?;
                match transition {
                    ClaimTransition::Claimed => {
                        if reclaim {
                            info!(job_id = %job.id, queue = %queue_type, retry_count = job.retry_count, "reclaimed stale job");
                        }
                        claimed.push(job);
                    }
                    ClaimTransition::Exhausted => {
                        warn!(job_id = %job.id, queue = %queue_type, retry_count = job.retry_count, "stale job exhausted its retries, marked failed");
                    }
                    ClaimTransition::Cancelled => {
                        info!(job_id = %job.id, queue = %queue_type, "stale job had a pending cancel request, marked cancelled");
                    }
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        run_token: RunToken,
        context: Option<JsonValue>,
    ) -> Result<HeartbeatOutcome, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE fhirq_jobs
            SET heartbeat_at = clock_timestamp(),
                context = COALESCE($3, context)
            WHERE id = $1 AND run_token = $2 AND status = 'running'
            RETURNING cancel_requested
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(run_token.as_uuid())
        .bind(context)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        match row {
            Some(row) => {
                let cancel_requested: bool = row.try_get("cancel_requested").map_err(|e| {
                    JobStoreError::Serialization(format!("failed to read cancel_requested: {e}"))
                })?;
                Ok(HeartbeatOutcome::Alive { cancel_requested })
            }
            None => Ok(HeartbeatOutcome::Lost),
        }
    }

    async fn complete(
        &self,
        job_id: JobId,
        run_token: RunToken,
        result: JsonValue,
    ) -> Result<CompleteOutcome, JobStoreError> {
        self.transition("complete", job_id, CompleteOutcome::Lost, |job, now| {
            job.complete(now, run_token, result)
        })
        .await
    }

    async fn fail(
        &self,
        job_id: JobId,
        run_token: RunToken,
        failure: Failure,
    ) -> Result<FailOutcome, JobStoreError> {
        self.transition("fail", job_id, FailOutcome::Lost, |job, now| {
            job.fail(now, run_token, failure)
        })
        .await
    }

    async fn release(
        &self,
        job_id: JobId,
        run_token: RunToken,
        reason: &str,
    ) -> Result<ReleaseOutcome, JobStoreError> {
        self.transition("release", job_id, ReleaseOutcome::Lost, |job, now| {
            job.release(now, run_token, reason)
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn request_cancel(
        &self,
        job_id: JobId,
        expected_version: ExpectedVersion,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let mut job = Self::lock_job(&mut tx, job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        let now = db_now(&mut tx).await?;
        expected_version.check(job.version)?;
        if job.request_cancel(now) {
            write_job(&mut tx, &job).await?;
            info!(job_id = %job_id, status = %job.status, "cancel requested");
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(group_id = %group_id), err)]
    async fn request_cancel_group(&self, group_id: GroupId) -> Result<usize, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM fhirq_jobs
            WHERE group_id = $1 AND status IN ('queued', 'running')
            ORDER BY created_at, id
            FOR UPDATE
            "#
        ))
        .bind(group_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_group", e))?;
        let now = db_now(&mut tx).await?;

        let mut changed = 0;
        for mut job in decode_jobs(rows)? {
            if job.request_cancel(now) {
                write_job(&mut tx, &job).await?;
                changed += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        info!(group_id = %group_id, changed, "group cancel requested");
        Ok(changed)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM fhirq_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    async fn list_group(&self, group_id: GroupId) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM fhirq_jobs WHERE group_id = $1 ORDER BY created_at, id"
        ))
        .bind(group_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_group", e))?;
        decode_jobs(rows)
    }

    async fn list_jobs(
        &self,
        tenant_id: TenantId,
        filter: JobFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM fhirq_jobs
            WHERE tenant_id = $1
                AND ($2::text IS NULL OR queue_type = $2)
                AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at, id
            LIMIT $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(filter.queue_type.as_ref().map(|q| q.to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;
        decode_jobs(rows)
    }

    async fn available_slots(
        &self,
        queue_type: &QueueType,
        heartbeat_timeout: Duration,
    ) -> Result<usize, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        let now = db_now(&mut conn).await?;
        let live =
            Self::live_running(&mut conn, queue_type, stale_cutoff(now, heartbeat_timeout)).await?;
        Ok(self.admission.available_slots(queue_type, live))
    }

    async fn queue_stats(
        &self,
        queue_type: &QueueType,
        heartbeat_timeout: Duration,
    ) -> Result<QueueStats, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_connection", e))?;
        let now = db_now(&mut conn).await?;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'queued') AS queued,
                COUNT(*) FILTER (WHERE status = 'running' AND heartbeat_at >= $2) AS running,
                COUNT(*) FILTER (WHERE status = 'running' AND heartbeat_at < $2) AS stale,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled
            FROM fhirq_jobs
            WHERE queue_type = $1
            "#,
        )
        .bind(queue_type.to_string())
        .bind(stale_cutoff(now, heartbeat_timeout))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let count = |column: &str| -> Result<usize, JobStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| {
                JobStoreError::Serialization(format!("failed to read {column}: {e}"))
            })?;
            Ok(n.max(0) as usize)
        };
        Ok(QueueStats {
            queued: count("queued")?,
            running: count("running")?,
            stale: count("stale")?,
            completed: count("completed")?,
            failed: count("failed")?,
            cancelled: count("cancelled")?,
        })
    }
}

async fn db_now(conn: &mut PgConnection) -> Result<DateTime<Utc>, JobStoreError> {
    let row = sqlx::query("SELECT clock_timestamp() AS now")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("read_clock", e))?;
    row.try_get("now")
        .map_err(|e| JobStoreError::Serialization(format!("failed to read database clock: {e}")))
}

/// Heartbeats strictly older than this are stale.
fn stale_cutoff(now: DateTime<Utc>, heartbeat_timeout: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_chrono(heartbeat_timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn check_exclusive(
    conn: &mut PgConnection,
    pending: &[Job],
    request: &EnqueueRequest,
) -> Result<(), JobStoreError> {
    let conflict = || {
        JobStoreError::Conflict(format!(
            "an active {} job already exists for tenant {}",
            request.queue_type, request.tenant_id
        ))
    };
    let in_batch = pending.iter().any(|j| {
        j.queue_type == request.queue_type && j.tenant_id == request.tenant_id
    });
    if in_batch {
        return Err(conflict());
    }

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("enqueue:{}:{}", request.queue_type, request.tenant_id))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("advisory_lock", e))?;

    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM fhirq_jobs
            WHERE queue_type = $1 AND tenant_id = $2 AND status IN ('queued', 'running')
        ) AS active
        "#,
    )
    .bind(request.queue_type.to_string())
    .bind(request.tenant_id.as_uuid())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("check_exclusive", e))?;
    let active: bool = row
        .try_get("active")
        .map_err(|e| JobStoreError::Serialization(format!("failed to read active: {e}")))?;
    if active { Err(conflict()) } else { Ok(()) }
}

async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<(), JobStoreError> {
    let history = history_json(&job.history)?;
    sqlx::query(
        r#"
        INSERT INTO fhirq_jobs (
            id, tenant_id, queue_type, group_id, status, priority, definition,
            result, context, heartbeat_at, run_token, retry_count, max_retry_count,
            cancel_requested, version, created_at, started_at, completed_at, history
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.tenant_id.as_uuid())
    .bind(job.queue_type.to_string())
    .bind(job.group_id.map(uuid::Uuid::from))
    .bind(job.status.as_str())
    .bind(job.priority)
    .bind(&job.definition)
    .bind(&job.result)
    .bind(&job.context)
    .bind(job.heartbeat_at)
    .bind(job.run_token.map(uuid::Uuid::from))
    .bind(i64::from(job.retry_count))
    .bind(i64::from(job.max_retry_count))
    .bind(job.cancel_requested)
    .bind(version_to_db(job.version)?)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(history)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

/// Persist the mutable columns of a locked row.
async fn write_job(conn: &mut PgConnection, job: &Job) -> Result<(), JobStoreError> {
    let history = history_json(&job.history)?;
    sqlx::query(
        r#"
        UPDATE fhirq_jobs
        SET status = $2,
            result = $3,
            context = $4,
            heartbeat_at = $5,
            run_token = $6,
            retry_count = $7,
            cancel_requested = $8,
            version = $9,
            started_at = $10,
            completed_at = $11,
            history = $12
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(&job.result)
    .bind(&job.context)
    .bind(job.heartbeat_at)
    .bind(job.run_token.map(uuid::Uuid::from))
    .bind(i64::from(job.retry_count))
    .bind(job.cancel_requested)
    .bind(version_to_db(job.version)?)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(history)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

fn history_json(history: &[AttemptRecord]) -> Result<JsonValue, JobStoreError> {
    serde_json::to_value(history)
        .map_err(|e| JobStoreError::Serialization(format!("failed to encode history: {e}")))
}

fn version_to_db(version: u64) -> Result<i64, JobStoreError> {
    i64::try_from(version)
        .map_err(|_| JobStoreError::Serialization(format!("version {version} out of range")))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code() {
                Some(code) => classify_sqlstate(&code, msg),
                None => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn classify_sqlstate(code: &str, msg: String) -> JobStoreError {
    match code {
        // Unique violation
        "23505" => JobStoreError::Conflict(msg),
        // lock_not_available
        "55P03" => JobStoreError::Unavailable(msg),
        _ if ["08", "40", "53", "57"].iter().any(|class| code.starts_with(class)) => {
            JobStoreError::Unavailable(msg)
        }
        _ => JobStoreError::Storage(msg),
    }
}

fn decode_jobs(rows: Vec<PgRow>) -> Result<Vec<Job>, JobStoreError> {
    rows.iter().map(decode_job).collect()
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Serialization(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    tenant_id: uuid::Uuid,
    queue_type: String,
    group_id: Option<uuid::Uuid>,
    status: String,
    priority: Option<i32>,
    definition: JsonValue,
    result: Option<JsonValue>,
    context: Option<JsonValue>,
    heartbeat_at: DateTime<Utc>,
    run_token: Option<uuid::Uuid>,
    retry_count: i64,
    max_retry_count: i64,
    cancel_requested: bool,
    version: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    history: JsonValue,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            queue_type: row.try_get("queue_type")?,
            group_id: row.try_get("group_id")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            definition: row.try_get("definition")?,
            result: row.try_get("result")?,
            context: row.try_get("context")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            run_token: row.try_get("run_token")?,
            retry_count: row.try_get("retry_count")?,
            max_retry_count: row.try_get("max_retry_count")?,
            cancel_requested: row.try_get("cancel_requested")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            history: row.try_get("history")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| JobStoreError::Serialization(format!("unknown status {:?}", row.status)))?;
        let queue_type: QueueType = row
            .queue_type
            .parse()
            .map_err(|e| JobStoreError::Serialization(format!("job {}: {e}", row.id)))?;
        let count = |name: &str, value: i64| {
            u32::try_from(value).map_err(|_| {
                JobStoreError::Serialization(format!("job {}: {name} {value} out of range", row.id))
            })
        };
        let history: Vec<AttemptRecord> = serde_json::from_value(row.history)
            .map_err(|e| JobStoreError::Serialization(format!("job {}: bad history: {e}", row.id)))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            queue_type,
            group_id: row.group_id.map(GroupId::from_uuid),
            status,
            priority: row.priority,
            definition: row.definition,
            result: row.result,
            context: row.context,
            heartbeat_at: row.heartbeat_at,
            run_token: row.run_token.map(RunToken::from_uuid),
            retry_count: count("retry_count", row.retry_count)?,
            max_retry_count: count("max_retry_count", row.max_retry_count)?,
            cancel_requested: row.cancel_requested,
            version: u64::try_from(row.version).map_err(|_| {
                JobStoreError::Serialization(format!("job {}: negative version", row.id))
            })?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            history,
        })
    }
}
