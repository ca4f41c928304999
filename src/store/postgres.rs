use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::{ClaimRequest, JobStore, Retention, RetentionPolicy, StoreError};
use crate::models::job::{JobDefinition, JobId, JobRecord, JobResult, JobState, WorkerId};

const RECORD_COLUMNS: &str = "id, item_ids, state, progress, attempts, last_error, result, \
     claimed_by, lease_ms, lease_expires_at, created_at, finished_at";

/// Guard shared by every lease-holder write.
const HOLDS_LEASE: &str =
    "id = $1 AND state = 'active' AND claimed_by = $2 AND lease_expires_at > NOW()";

/// PostgreSQL-backed job store. Claims use `FOR UPDATE SKIP LOCKED` so
/// concurrent workers only ever contend on the row they are taking.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded write matched no row.
    async fn lease_violation(&self, job_id: JobId, worker_id: &WorkerId) -> StoreError {
        match self.get(job_id).await {
            Ok(Some(record)) => match record.check_lease(worker_id, Utc::now()) {
                Err(violation) => StoreError::from_violation(violation, job_id, worker_id),
                // Database clock says expired even if ours does not.
                Ok(()) => StoreError::LeaseExpired(job_id),
            },
            Ok(None) => StoreError::NotFound(job_id),
            Err(e) => e,
        }
    }

    async fn sweep_kind(&self, state: JobState, retention: &Retention) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM batch_jobs
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, finished_at,
                           ROW_NUMBER() OVER (ORDER BY finished_at DESC) AS rank
                    FROM batch_jobs
                    WHERE state = $1
                ) ranked
                WHERE rank > $2 OR finished_at < NOW() - make_interval(secs => $3)
            )
            "#,
        )
        .bind(state.to_string())
        .bind(retention.max_count as i64)
        .bind(seconds(retention.max_age))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

fn record_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    let job_id = JobId(row.try_get("id")?);
    let corrupt = |reason: String| StoreError::Corrupt { job_id, reason };

    let state: String = row.try_get("state")?;
    let state = state
        .parse::<JobState>()
        .map_err(|_| corrupt(format!("unknown state {:?}", state)))?;

    let item_ids = row
        .try_get::<Vec<i64>, _>("item_ids")?
        .into_iter()
        .map(u64::try_from)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| corrupt(e.to_string()))?;

    let progress: i16 = row.try_get("progress")?;
    let attempts: i32 = row.try_get("attempts")?;
    let result = row
        .try_get::<Option<serde_json::Value>, _>("result")?
        .map(serde_json::from_value::<JobResult>)
        .transpose()?;
    let claimed_by: Option<String> = row.try_get("claimed_by")?;
    let lease_ms: Option<i64> = row.try_get("lease_ms")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(JobRecord {
        definition: JobDefinition {
            id: job_id,
            item_ids,
            created_at,
        },
        state,
        progress: progress.clamp(0, 100) as u8,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        result,
        claimed_by: claimed_by.map(WorkerId),
        lease: lease_ms.map(Duration::milliseconds),
        lease_expires_at: row.try_get("lease_expires_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, definition: JobDefinition) -> Result<JobId, StoreError> {
        let item_ids = definition
            .item_ids
            .iter()
            .map(|id| i64::try_from(*id))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Corrupt {
                job_id: definition.id,
                reason: e.to_string(),
            })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_jobs (id, item_ids, state, created_at)
            VALUES ($1, $2, 'queued', $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(definition.id.0)
        .bind(item_ids)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(StoreError::DuplicateJob(definition.id));
        }
        Ok(definition.id)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<JobRecord>, StoreError> {
        loop {
            let mut tx = self.pool.begin().await?;

            let candidate = sqlx::query(&format!(
                r#"
                SELECT {RECORD_COLUMNS}
                FROM batch_jobs
                WHERE state = 'queued'
                   OR (state = 'active' AND (lease_expires_at IS NULL OR lease_expires_at <= NOW()))
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#
            ))
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = candidate else {
                tx.commit().await?;
                return Ok(None);
            };
            let record = record_from_row(&row)?;

            if record.attempts >= request.max_attempts {
                let result = record.exhausted_result();
                sqlx::query(
                    r#"
                    UPDATE batch_jobs
                    SET state = 'failed', progress = 100, result = $2,
                        claimed_by = NULL, lease_ms = NULL, lease_expires_at = NULL,
                        finished_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(record.id().0)
                .bind(serde_json::to_value(&result)?)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                metrics::counter!("jobs_dead_lettered_total").increment(1);
                tracing::warn!(
                    job_id = %record.id(),
                    attempts = record.attempts,
                    reason = %result.message,
                    "Job dead-lettered after exhausting retries"
                );
                continue;
            }

            let row = sqlx::query(&format!(
                r#"
                UPDATE batch_jobs
                SET state = 'active',
                    claimed_by = $2,
                    lease_ms = $3,
                    lease_expires_at = NOW() + make_interval(secs => $4),
                    attempts = attempts + 1
                WHERE id = $1
                RETURNING {RECORD_COLUMNS}
                "#
            ))
            .bind(record.id().0)
            .bind(request.worker_id.as_str())
            .bind(request.lease.num_milliseconds())
            .bind(seconds(request.lease))
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            let claimed = record_from_row(&row)?;
            tracing::debug!(
                job_id = %claimed.id(),
                worker_id = %request.worker_id,
                attempt = claimed.attempts,
                "Claimed job"
            );
            return Ok(Some(claimed));
        }
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        progress: u8,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE batch_jobs
            SET progress = GREATEST(progress, $3),
                lease_expires_at = NOW() + make_interval(secs => lease_ms::double precision / 1000)
            WHERE {HOLDS_LEASE}
            "#
        ))
        .bind(job_id.0)
        .bind(worker_id.as_str())
        .bind(i16::from(progress.min(100)))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.lease_violation(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn finish(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result: JobResult,
        final_state: JobState,
    ) -> Result<(), StoreError> {
        debug_assert!(final_state.is_terminal());
        let updated = sqlx::query(&format!(
            r#"
            UPDATE batch_jobs
            SET state = $3, progress = 100, result = $4,
                claimed_by = NULL, lease_ms = NULL, lease_expires_at = NULL,
                finished_at = NOW()
            WHERE {HOLDS_LEASE}
            "#
        ))
        .bind(job_id.0)
        .bind(worker_id.as_str())
        .bind(final_state.to_string())
        .bind(serde_json::to_value(&result)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.lease_violation(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn defer_retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        retry_in: Duration,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE batch_jobs
            SET last_error = $3,
                lease_expires_at = NOW() + make_interval(secs => $4)
            WHERE {HOLDS_LEASE}
            "#
        ))
        .bind(job_id.0)
        .bind(worker_id.as_str())
        .bind(error)
        .bind(seconds(retry_in))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(self.lease_violation(job_id, worker_id).await);
        }
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM batch_jobs WHERE id = $1"
        ))
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn sweep(&self, policy: &RetentionPolicy) -> Result<u64, StoreError> {
        let completed = self.sweep_kind(JobState::Completed, &policy.completed).await?;
        let failed = self.sweep_kind(JobState::Failed, &policy.failed).await?;
        Ok(completed + failed)
    }

    async fn queue_depth(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS depth
            FROM batch_jobs
            WHERE state = 'queued'
               OR (state = 'active' AND (lease_expires_at IS NULL OR lease_expires_at <= NOW()))
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let depth: i64 = row.try_get("depth")?;
        Ok(depth.max(0) as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
