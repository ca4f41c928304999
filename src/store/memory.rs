use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use super::{ClaimRequest, JobStore, RetentionPolicy, StoreError};
use crate::models::job::{JobDefinition, JobId, JobRecord, JobResult, JobState, WorkerId};

type Slot = Arc<Mutex<JobRecord>>;

/// In-memory job store for tests/dev.
///
/// The map lock is only taken to insert, look up or remove slots; every
/// state transition happens under the individual record's mutex, so
/// unrelated jobs never contend with each other. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: RwLock<HashMap<JobId, Slot>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn slot(&self, job_id: JobId) -> Result<Slot, StoreError> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    fn snapshot(&self) -> Vec<Slot> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Run `apply` on a record the caller still holds a live lease on.
    fn with_lease<F>(&self, job_id: JobId, worker_id: &WorkerId, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let slot = self.slot(job_id)?;
        let mut record = lock(&slot);
        record
            .check_lease(worker_id, Utc::now())
            .map_err(|v| StoreError::from_violation(v, job_id, worker_id))?;
        apply(&mut record);
        Ok(())
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, JobRecord> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, definition: JobDefinition) -> Result<JobId, StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let id = definition.id;
        if records.contains_key(&id) {
            return Err(StoreError::DuplicateJob(id));
        }
        records.insert(id, Arc::new(Mutex::new(JobRecord::queued(definition))));
        Ok(id)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<Option<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut candidates: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter_map(|slot| {
                let record = lock(&slot);
                record
                    .is_claimable(now)
                    .then(|| (record.created_at(), record.id(), slot.clone()))
            })
            .collect();

        // FIFO by creation time
        candidates.sort_by_key(|(created_at, id, _)| (*created_at, *id));

        for (_, job_id, slot) in candidates {
            let mut record = lock(&slot);
            let now = Utc::now();
            // Another worker may have taken it since the scan.
            if !record.is_claimable(now) {
                continue;
            }

            if record.attempts >= request.max_attempts {
                dead_letter(&mut record, now);
                continue;
            }

            record.take_lease(&request.worker_id, request.lease, now);
            tracing::debug!(
                job_id = %job_id,
                worker_id = %request.worker_id,
                attempt = record.attempts,
                "Claimed job"
            );
            return Ok(Some(record.clone()));
        }

        Ok(None)
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        progress: u8,
    ) -> Result<(), StoreError> {
        self.with_lease(job_id, worker_id, |record| {
            record.progress = record.progress.max(progress.min(100));
            record.refresh_lease(Utc::now());
        })
    }

    async fn finish(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result: JobResult,
        final_state: JobState,
    ) -> Result<(), StoreError> {
        debug_assert!(final_state.is_terminal());
        self.with_lease(job_id, worker_id, |record| {
            record.finalize(final_state, result, Utc::now());
        })
    }

    async fn defer_retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        retry_in: Duration,
    ) -> Result<(), StoreError> {
        self.with_lease(job_id, worker_id, |record| {
            record.last_error = Some(error.to_string());
            record.lease_expires_at = Some(Utc::now() + retry_in);
        })
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        match self.slot(job_id) {
            Ok(slot) => Ok(Some(lock(&slot).clone())),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn sweep(&self, policy: &RetentionPolicy) -> Result<u64, StoreError> {
        let now = Utc::now();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for slot in self.snapshot() {
            let record = lock(&slot);
            let Some(finished_at) = record.finished_at else {
                continue;
            };
            match record.state {
                JobState::Completed => completed.push((record.id(), finished_at)),
                JobState::Failed => failed.push((record.id(), finished_at)),
                JobState::Queued | JobState::Active => {}
            }
        }

        let mut expired = RetentionPolicy::expired_ids(&policy.completed, completed, now);
        expired.extend(RetentionPolicy::expired_ids(&policy.failed, failed, now));

        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let removed = expired
            .iter()
            .filter(|id| records.remove(id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn queue_depth(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let depth = self
            .snapshot()
            .iter()
            .filter(|slot| lock(slot).is_claimable(now))
            .count();
        Ok(depth as u64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Fail a record whose lease lapsed with no attempts left, keeping its definition.
fn dead_letter(record: &mut JobRecord, now: chrono::DateTime<Utc>) {
    let result = record.exhausted_result();
    tracing::warn!(
        job_id = %record.id(),
        attempts = record.attempts,
        reason = %result.message,
        "Job dead-lettered after exhausting retries"
    );
    record.finalize(JobState::Failed, result, now);
    metrics::counter!("jobs_dead_lettered_total").increment(1);
}
