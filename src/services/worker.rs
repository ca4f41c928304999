//! Worker pool: claim a job, check its items in order, report progress,
//! and finalize it, deferring or dead-lettering on transient checker failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checker::{CheckError, ItemChecker};
use super::retry::RetryPolicy;
use crate::models::job::{JobRecord, JobResult, JobState, WorkerId};
use crate::store::{ClaimRequest, JobStore, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for worker ids in logs and lease records.
    pub name: String,
    pub worker_count: usize,
    pub lease: Duration,
    /// Mean wait between claim attempts when the queue is empty; randomized ±50%.
    pub idle_poll: Duration,
    /// Upper bound on a single item check.
    pub check_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            worker_count: 4,
            lease: Duration::from_secs(30),
            idle_poll: Duration::from_secs(1),
            check_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// What happened to a claimed job on this attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { success_count: u32, failed_count: u32 },
    /// Every item was checked and none were available.
    AllUnavailable { failed_count: u32 },
    /// Transient failure; the job becomes claimable again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Transient failure on the last allowed attempt; the job is failed.
    RetriesExhausted { attempts: u32 },
    /// The lease was lost mid-flight; another worker owns the job now.
    Abandoned,
}

/// One member of the pool.
pub struct Worker {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    checker: Arc<dyn ItemChecker>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        store: Arc<dyn JobStore>,
        checker: Arc<dyn ItemChecker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            store,
            checker,
            config,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claim and process jobs until `shutdown` fires. A job in flight is
    /// always carried to the end of its attempt before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.id, "Worker started");

        while !shutdown.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tracing::trace!(worker_id = %self.id, "No jobs available, sleeping");
                    self.idle_interval()
                }
                Err(e) => {
                    tracing::error!(worker_id = %self.id, error = %e, "Job store error, backing off");
                    self.idle_interval()
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim one job and process it. Returns `None` when nothing was claimable.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, StoreError> {
        let request = ClaimRequest {
            worker_id: self.id.clone(),
            lease: chrono_duration(self.config.lease),
            max_attempts: self.config.retry.max_attempts,
        };

        let Some(record) = self.store.claim(&request).await? else {
            return Ok(None);
        };

        tracing::info!(
            job_id = %record.id(),
            worker_id = %self.id,
            attempt = record.attempts,
            total_items = record.total_items(),
            "Processing job"
        );

        let started = Instant::now();
        let outcome = match self.process(&record).await {
            Err(e) if e.is_lease_lost() => {
                tracing::warn!(
                    job_id = %record.id(),
                    worker_id = %self.id,
                    reason = %e,
                    "Lost lease, abandoning job"
                );
                JobOutcome::Abandoned
            }
            other => other?,
        };

        metrics::histogram!("job_processing_seconds").record(started.elapsed().as_secs_f64());
        Ok(Some(outcome))
    }

    /// Per-job processing loop over the items in submission order.
    async fn process(&self, record: &JobRecord) -> Result<JobOutcome, StoreError> {
        let job_id = record.id();
        let items = &record.definition.item_ids;
        let total = items.len();

        let mut success_count = 0u32;
        let mut failed_count = 0u32;
        let mut download_urls = Vec::new();

        for (index, item_id) in items.iter().enumerate() {
            match self.check_item(*item_id).await {
                Ok(check) if check.available => {
                    success_count += 1;
                    download_urls.extend(check.download_url);
                    metrics::counter!("items_checked_total", "outcome" => "available").increment(1);
                }
                Ok(_) => {
                    failed_count += 1;
                    metrics::counter!("items_checked_total", "outcome" => "unavailable").increment(1);
                }
                Err(e) => {
                    metrics::counter!("items_checked_total", "outcome" => "error").increment(1);
                    tracing::warn!(
                        job_id = %job_id,
                        worker_id = %self.id,
                        item_id,
                        error = %e,
                        "Item check failed"
                    );
                    return self.handle_transient_failure(record, &e).await;
                }
            }

            let progress = ((index + 1) * 100 / total) as u8;
            self.store.update_progress(job_id, &self.id, progress).await?;
        }

        if success_count > 0 {
            let result = JobResult::completed(success_count, failed_count, download_urls);
            self.store
                .finish(job_id, &self.id, result, JobState::Completed)
                .await?;
            metrics::counter!("jobs_completed_total").increment(1);
            tracing::info!(
                job_id = %job_id,
                worker_id = %self.id,
                success_count,
                failed_count,
                "Job completed"
            );
            Ok(JobOutcome::Completed {
                success_count,
                failed_count,
            })
        } else {
            let result = JobResult::all_unavailable(failed_count);
            self.store
                .finish(job_id, &self.id, result, JobState::Failed)
                .await?;
            metrics::counter!("jobs_failed_total", "reason" => "unavailable").increment(1);
            tracing::info!(
                job_id = %job_id,
                worker_id = %self.id,
                failed_count,
                "Job failed: no items available"
            );
            Ok(JobOutcome::AllUnavailable { failed_count })
        }
    }

    async fn check_item(&self, item_id: u64) -> Result<super::checker::ItemCheck, CheckError> {
        match tokio::time::timeout(self.config.check_timeout, self.checker.check(item_id)).await {
            Ok(result) => result,
            Err(_) => Err(CheckError::Other(format!(
                "check of item {} timed out after {:?}",
                item_id, self.config.check_timeout
            ))),
        }
    }

    /// Defer the job for a backoff delay, or fail it when the budget is spent.
    async fn handle_transient_failure(
        &self,
        record: &JobRecord,
        error: &CheckError,
    ) -> Result<JobOutcome, StoreError> {
        let job_id = record.id();
        let attempt = record.attempts;
        let retry = &self.config.retry;

        if retry.should_retry(attempt) {
            let delay = retry.delay(attempt);
            self.store
                .defer_retry(job_id, &self.id, &error.to_string(), chrono_duration(delay))
                .await?;
            metrics::counter!("jobs_retried_total").increment(1);
            tracing::info!(
                job_id = %job_id,
                worker_id = %self.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Job deferred for retry"
            );
            return Ok(JobOutcome::Retrying { attempt, delay });
        }

        let message = error.to_string();
        let result =
            JobResult::retries_exhausted(record.total_items() as u32, attempt, Some(&message));
        self.store
            .finish(job_id, &self.id, result, JobState::Failed)
            .await?;
        metrics::counter!("jobs_failed_total", "reason" => "retries_exhausted").increment(1);
        metrics::counter!("jobs_dead_lettered_total").increment(1);
        tracing::warn!(
            job_id = %job_id,
            worker_id = %self.id,
            attempts = attempt,
            item_ids = ?record.definition.item_ids,
            error = %message,
            "Job failed after max retries"
        );
        Ok(JobOutcome::RetriesExhausted { attempts: attempt })
    }

    fn idle_interval(&self) -> Duration {
        let mean = self.config.idle_poll.as_millis() as u64;
        if mean == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(mean / 2..=mean + mean / 2);
        Duration::from_millis(jittered)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// A fixed number of workers sharing one store and checker.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    checker: Arc<dyn ItemChecker>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        checker: Arc<dyn ItemChecker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            checker,
            config,
        }
    }

    fn worker(&self, index: usize) -> Worker {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = WorkerId::new(format!("{}-{}-{}", self.config.name, index, &suffix[..8]));
        Worker::new(
            id,
            self.store.clone(),
            self.checker.clone(),
            self.config.clone(),
        )
    }

    /// Spawn every worker onto the current tokio runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> WorkerPoolHandle {
        let mut tasks = JoinSet::new();
        for index in 0..self.config.worker_count.max(1) {
            let worker = self.worker(index);
            let token = shutdown.clone();
            tasks.spawn(async move { worker.run(token).await });
        }

        tracing::info!(
            workers = self.config.worker_count.max(1),
            lease_secs = self.config.lease.as_secs(),
            max_attempts = self.config.retry.max_attempts,
            "Worker pool started"
        );

        WorkerPoolHandle { shutdown, tasks }
    }
}

/// Handle to a running pool.
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPoolHandle {
    /// Ask every worker to stop after its current job and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for all workers to exit.
    pub async fn join(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobDefinition, JobId};
    use crate::services::checker::MockItemChecker;
    use crate::store::InMemoryJobStore;

    fn worker(store: Arc<InMemoryJobStore>) -> Worker {
        Worker::new(
            WorkerId::new("test-0"),
            store,
            Arc::new(MockItemChecker::default()),
            WorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn run_once_returns_none_on_empty_queue() {
        let worker = worker(InMemoryJobStore::arc());
        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn partial_availability_completes_the_job() {
        let store = InMemoryJobStore::arc();
        let id = store
            .create(JobDefinition::new(JobId::new(), vec![7, 8, 14]))
            .await
            .unwrap();

        let outcome = worker(store.clone()).run_once().await.unwrap();
        assert_eq!(
            outcome,
            Some(JobOutcome::Completed {
                success_count: 2,
                failed_count: 1
            })
        );

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Completed);
        let result = record.result.unwrap();
        assert_eq!(result.download_urls.len(), 2);
        assert_eq!(result.success_count + result.failed_count, 3);
    }

    #[test]
    fn idle_interval_stays_within_jitter_band() {
        let worker = worker(InMemoryJobStore::arc());
        for _ in 0..100 {
            let idle = worker.idle_interval();
            assert!(idle >= Duration::from_millis(500));
            assert!(idle <= Duration::from_millis(1500));
        }
    }
}
