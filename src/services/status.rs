use std::sync::Arc;

use crate::models::api::{ExternalState, ExternalStatus};
use crate::models::job::{JobId, JobRecord, JobState};
use crate::store::{JobStore, StoreError};

/// Map a live record onto the polling contract. Pure; safe to call at any rate.
pub fn project(record: &JobRecord) -> ExternalStatus {
    let (status, progress, result) = match record.state {
        JobState::Queued => (ExternalState::Queued, 0, None),
        JobState::Active => (ExternalState::Processing, record.progress.min(100), None),
        JobState::Completed => (ExternalState::Completed, 100, record.result.clone()),
        JobState::Failed => (ExternalState::Failed, 100, record.result.clone()),
    };

    ExternalStatus {
        job_id: record.id(),
        status,
        progress,
        total_items: record.total_items(),
        result,
    }
}

/// Read-only view over the job store for pollers.
#[derive(Clone)]
pub struct StatusProjector {
    store: Arc<dyn JobStore>,
}

impl StatusProjector {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn status(&self, job_id: JobId) -> Result<ExternalStatus, StatusError> {
        self.store
            .get(job_id)
            .await?
            .map(|record| project(&record))
            .ok_or(StatusError::NotFound(job_id))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}
