//! Durable job records and the atomic operations workers coordinate through.
//!
//! Every mutation is scoped to a single record: claims re-check eligibility
//! under that record's own lock (or row lock), and writes from workers are
//! conditional on the caller still holding an unexpired lease.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::job::{JobDefinition, JobId, JobRecord, JobResult, JobState, LeaseViolation, WorkerId};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobStore;
pub use postgres::PgJobStore;

/// Parameters for a single claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: WorkerId,
    pub lease: Duration,
    /// Records whose lease lapsed with this many attempts already spent are
    /// dead-lettered instead of handed out.
    pub max_attempts: u32,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new queued record for `definition`.
    async fn create(&self, definition: JobDefinition) -> Result<JobId, StoreError>;

    /// Atomically take ownership of the oldest claimable record.
    async fn claim(&self, request: &ClaimRequest) -> Result<Option<JobRecord>, StoreError>;

    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        progress: u8,
    ) -> Result<(), StoreError>;

    /// Write the result and move the record to a terminal state.
    async fn finish(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result: JobResult,
        final_state: JobState,
    ) -> Result<(), StoreError>;

    /// Record a transient failure and let the lease lapse after `retry_in`.
    async fn defer_retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        retry_in: Duration,
    ) -> Result<(), StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Delete terminal records that fall outside `policy`. Returns the count removed.
    async fn sweep(&self, policy: &RetentionPolicy) -> Result<u64, StoreError>;

    /// Number of records a worker could claim right now.
    async fn queue_depth(&self) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("worker {worker} does not own job {job_id}")]
    NotOwner { job_id: JobId, worker: WorkerId },

    #[error("lease on job {0} has expired")]
    LeaseExpired(JobId),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record {job_id}: {reason}")]
    Corrupt { job_id: JobId, reason: String },
}

impl StoreError {
    /// True when the caller lost its lease and must stop working on the job.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, StoreError::NotOwner { .. } | StoreError::LeaseExpired(_))
    }

    pub(crate) fn from_violation(violation: LeaseViolation, job_id: JobId, worker: &WorkerId) -> Self {
        match violation {
            LeaseViolation::NotOwner => StoreError::NotOwner {
                job_id,
                worker: worker.clone(),
            },
            LeaseViolation::Expired => StoreError::LeaseExpired(job_id),
        }
    }
}

/// How many terminal records of one kind to keep, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_count: usize,
    pub max_age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: Retention,
    pub failed: Retention,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: Retention {
                max_count: 1000,
                max_age: Duration::hours(1),
            },
            failed: Retention {
                max_count: 5000,
                max_age: Duration::hours(24),
            },
        }
    }
}

impl RetentionPolicy {
    pub fn for_state(&self, state: JobState) -> Option<&Retention> {
        match state {
            JobState::Completed => Some(&self.completed),
            JobState::Failed => Some(&self.failed),
            JobState::Queued | JobState::Active => None,
        }
    }

    /// Pick the ids to delete from `(id, finished_at)` pairs of one terminal kind.
    pub fn expired_ids(
        retention: &Retention,
        mut finished: Vec<(JobId, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Vec<JobId> {
        finished.sort_by(|a, b| b.1.cmp(&a.1));
        finished
            .into_iter()
            .enumerate()
            .filter(|(rank, (_, at))| *rank >= retention.max_count || now - *at > retention.max_age)
            .map(|(_, (id, _))| id)
            .collect()
    }
}
