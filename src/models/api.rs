use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobId, JobResult};

/// Inclusive bounds for item identifiers accepted at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemIdBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for ItemIdBounds {
    fn default() -> Self {
        Self {
            min: 1,
            max: 1_000_000,
        }
    }
}

/// Body of `POST /api/v1/jobs`.
#[derive(Debug, Deserialize, Validate)]
#[garde(context(ItemIdBounds))]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[garde(length(min = 1, max = 1000), custom(item_ids_in_bounds))]
    pub item_ids: Vec<u64>,

    /// Caller-chosen id; resubmitting the same id is rejected.
    #[garde(skip)]
    pub job_id: Option<Uuid>,
}

fn item_ids_in_bounds(item_ids: &Vec<u64>, bounds: &ItemIdBounds) -> garde::Result {
    match item_ids
        .iter()
        .find(|id| **id < bounds.min || **id > bounds.max)
    {
        Some(id) => Err(garde::Error::new(format!(
            "item id {} outside of {}..={}",
            id, bounds.min, bounds.max
        ))),
        None => Ok(()),
    }
}

/// Response after a job has been accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: ExternalState,
    pub total_items: usize,
}

/// Externally visible job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ExternalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExternalState::Completed | ExternalState::Failed)
    }
}

/// Response for `GET /api/v1/jobs/{job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalStatus {
    pub job_id: JobId,
    pub status: ExternalState,
    pub progress: u8,
    pub total_items: usize,
    pub result: Option<JobResult>,
}
