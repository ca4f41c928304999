use std::sync::Arc;

use garde::Validate;

use crate::models::api::{ExternalState, ItemIdBounds, SubmitJobRequest, SubmitJobResponse};
use crate::models::job::{JobDefinition, JobId};
use crate::store::{JobStore, StoreError};

/// Turns accepted submissions into queued job records. Never waits for processing.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    bounds: ItemIdBounds,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, bounds: ItemIdBounds) -> Self {
        Self { store, bounds }
    }

    /// Validate a client request and enqueue it.
    pub async fn submit(&self, request: SubmitJobRequest) -> Result<SubmitJobResponse, DispatchError> {
        request.validate_with(&self.bounds)?;

        let job_id = request.job_id.map(JobId).unwrap_or_default();
        let total_items = request.item_ids.len();
        let definition = JobDefinition::new(job_id, request.item_ids);
        let job_id = self.dispatch(definition).await?;

        Ok(SubmitJobResponse {
            job_id,
            status: ExternalState::Queued,
            total_items,
        })
    }

    /// Hand an already validated definition to the store.
    pub async fn dispatch(&self, definition: JobDefinition) -> Result<JobId, DispatchError> {
        let total_items = definition.total_items();
        let job_id = match self.store.create(definition).await {
            Ok(id) => id,
            Err(StoreError::DuplicateJob(id)) => {
                tracing::info!(job_id = %id, "Rejected duplicate job submission");
                return Err(DispatchError::Duplicate(id));
            }
            Err(e) => return Err(DispatchError::Store(e)),
        };

        metrics::counter!("jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job_id, total_items, "Job queued");
        Ok(job_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid submission: {0}")]
    Validation(#[from] garde::Report),

    #[error("Job {0} was already submitted")]
    Duplicate(JobId),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}
