use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one worker in the pool; the lease holder on an active record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable description of a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    pub item_ids: Vec<u64>,
    pub created_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(id: JobId, item_ids: Vec<u64>) -> Self {
        Self {
            id,
            item_ids,
            created_at: Utc::now(),
        }
    }

    pub fn total_items(&self) -> usize {
        self.item_ids.len()
    }
}

/// Internal lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Outcome written once a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub success_count: u32,
    pub failed_count: u32,
    pub download_urls: Vec<String>,
    pub message: String,
}

impl JobResult {
    pub fn completed(success_count: u32, failed_count: u32, download_urls: Vec<String>) -> Self {
        let message = if failed_count == 0 {
            format!("All {} items are available", success_count)
        } else {
            format!(
                "{} of {} items are available; {} unavailable",
                success_count,
                success_count + failed_count,
                failed_count
            )
        };
        Self {
            success_count,
            failed_count,
            download_urls,
            message,
        }
    }

    /// Every item was checked and reported unavailable.
    pub fn all_unavailable(failed_count: u32) -> Self {
        Self {
            success_count: 0,
            failed_count,
            download_urls: Vec::new(),
            message: format!("None of the {} items are available", failed_count),
        }
    }

    /// The checker kept failing until the attempt budget ran out.
    pub fn retries_exhausted(total_items: u32, attempts: u32, last_error: Option<&str>) -> Self {
        let message = match last_error {
            Some(err) => format!(
                "Retries exhausted after {} attempts; last error: {}",
                attempts, err
            ),
            None => format!("Retries exhausted after {} attempts", attempts),
        };
        Self {
            success_count: 0,
            failed_count: total_items,
            download_urls: Vec::new(),
            message,
        }
    }
}

/// The mutable unit of truth for one job, owned by the job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub definition: JobDefinition,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
    pub claimed_by: Option<WorkerId>,
    /// Length of the lease granted at claim time; progress writes extend by this much.
    pub lease: Option<Duration>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn queued(definition: JobDefinition) -> Self {
        Self {
            definition,
            state: JobState::Queued,
            progress: 0,
            attempts: 0,
            last_error: None,
            result: None,
            claimed_by: None,
            lease: None,
            lease_expires_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.definition.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.definition.created_at
    }

    pub fn total_items(&self) -> usize {
        self.definition.total_items()
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map_or(true, |expiry| expiry <= now)
    }

    /// Queued, or active with a lapsed lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Queued => true,
            JobState::Active => self.lease_expired(now),
            JobState::Completed | JobState::Failed => false,
        }
    }

    /// Checks that `worker` holds an unexpired lease on this record.
    pub fn check_lease(&self, worker: &WorkerId, now: DateTime<Utc>) -> Result<(), LeaseViolation> {
        if self.state != JobState::Active || self.claimed_by.as_ref() != Some(worker) {
            return Err(LeaseViolation::NotOwner);
        }
        if self.lease_expired(now) {
            return Err(LeaseViolation::Expired);
        }
        Ok(())
    }

    /// Result for a record whose lease lapsed after its last allowed attempt.
    pub fn exhausted_result(&self) -> JobResult {
        let last_error = self
            .last_error
            .as_deref()
            .unwrap_or("worker lease expired before the job finished");
        JobResult::retries_exhausted(self.total_items() as u32, self.attempts, Some(last_error))
    }

    pub(crate) fn take_lease(&mut self, worker: &WorkerId, lease: Duration, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.claimed_by = Some(worker.clone());
        self.lease = Some(lease);
        self.lease_expires_at = Some(now + lease);
        self.attempts += 1;
    }

    /// Push the lease expiry out by the originally granted length.
    pub(crate) fn refresh_lease(&mut self, now: DateTime<Utc>) {
        if let Some(lease) = self.lease {
            self.lease_expires_at = Some(now + lease);
        }
    }

    pub(crate) fn finalize(&mut self, state: JobState, result: JobResult, now: DateTime<Utc>) {
        self.state = state;
        self.progress = 100;
        self.result = Some(result);
        self.claimed_by = None;
        self.lease = None;
        self.lease_expires_at = None;
        self.finished_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseViolation {
    NotOwner,
    Expired,
}
