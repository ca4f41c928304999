//! Test helper utilities: scripted checkers, fast worker settings and pollers.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use batch_fetch_queue::models::api::ExternalStatus;
use batch_fetch_queue::models::job::JobId;
use batch_fetch_queue::services::checker::{CheckError, ItemCheck, ItemChecker, MockItemChecker};
use batch_fetch_queue::services::retry::RetryPolicy;
use batch_fetch_queue::services::status::StatusProjector;
use batch_fetch_queue::services::worker::WorkerConfig;

/// Worker settings tuned so tests finish in milliseconds.
pub fn fast_worker_config(worker_count: usize, max_attempts: u32) -> WorkerConfig {
    WorkerConfig {
        name: "test".to_string(),
        worker_count,
        lease: Duration::from_secs(5),
        idle_poll: Duration::from_millis(5),
        check_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    }
}

/// Checker that always fails with an infrastructure error.
#[derive(Default)]
pub struct BrokenChecker {
    pub calls: AtomicU32,
}

#[async_trait]
impl ItemChecker for BrokenChecker {
    async fn check(&self, item_id: u64) -> Result<ItemCheck, CheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CheckError::Other(format!("connection refused for {}", item_id)))
    }
}

/// Fails the first `failures` calls, then answers like the mock checker.
pub struct FlakyChecker {
    failures: u32,
    calls: AtomicU32,
    inner: MockItemChecker,
}

impl FlakyChecker {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            inner: MockItemChecker::default(),
        }
    }
}

#[async_trait]
impl ItemChecker for FlakyChecker {
    async fn check(&self, item_id: u64) -> Result<ItemCheck, CheckError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(CheckError::Other("temporary outage".to_string()));
        }
        self.inner.check(item_id).await
    }
}

/// Mock checker that takes `delay` per item.
pub struct SlowChecker {
    pub delay: Duration,
    pub inner: MockItemChecker,
}

impl SlowChecker {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            inner: MockItemChecker::default(),
        })
    }
}

#[async_trait]
impl ItemChecker for SlowChecker {
    async fn check(&self, item_id: u64) -> Result<ItemCheck, CheckError> {
        sleep(self.delay).await;
        self.inner.check(item_id).await
    }
}

/// Poll at a fixed interval until a terminal status is observed or the
/// timeout elapses. Returns every status seen, in order.
pub async fn poll_until_terminal(
    projector: &StatusProjector,
    job_id: JobId,
    interval: Duration,
    timeout: Duration,
) -> Vec<ExternalStatus> {
    let deadline = Instant::now() + timeout;
    let mut observed = Vec::new();

    loop {
        let status = projector.status(job_id).await.expect("job exists while polling");
        let terminal = status.status.is_terminal();
        observed.push(status);
        if terminal {
            return observed;
        }
        assert!(
            Instant::now() < deadline,
            "job {} did not reach a terminal state within {:?}",
            job_id,
            timeout
        );
        sleep(interval).await;
    }
}

/// Submit a batch to a running server.
pub async fn submit_batch(
    client: &reqwest::Client,
    base_url: &str,
    item_ids: &[u64],
) -> Result<serde_json::Value, String> {
    let response = client
        .post(format!("{}/api/v1/jobs", base_url))
        .json(&serde_json::json!({ "itemIds": item_ids }))
        .send()
        .await
        .map_err(|e| format!("Submit request failed: {}", e))?;

    if response.status() != reqwest::StatusCode::ACCEPTED {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("Submit failed with status {}: {}", status, body));
    }

    response
        .json()
        .await
        .map_err(|e| format!("Failed to parse submit response: {}", e))
}

/// Poll a running server until the job is terminal. Returns every status body seen.
pub async fn poll_job_http(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<Vec<serde_json::Value>, String> {
    let deadline = Instant::now() + timeout;
    let mut observed = Vec::new();

    loop {
        let response = client
            .get(format!("{}/api/v1/jobs/{}", base_url, job_id))
            .send()
            .await
            .map_err(|e| format!("Status request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("Status request returned {}", response.status()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse status: {}", e))?;
        let terminal = matches!(body["status"].as_str(), Some("completed" | "failed"));
        observed.push(body);
        if terminal {
            return Ok(observed);
        }
        if Instant::now() >= deadline {
            return Err(format!("Job {} not terminal after {:?}", job_id, timeout));
        }
        sleep(interval).await;
    }
}
