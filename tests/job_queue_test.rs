//! Queue behaviour against the in-memory store: submission, claiming,
//! processing, retry/backoff and the polled status contract.

mod fixtures;
mod helpers;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fixtures::BATCH_FIXTURES;
use helpers::*;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use batch_fetch_queue::models::api::{ExternalState, ItemIdBounds, SubmitJobRequest};
use batch_fetch_queue::models::job::{JobDefinition, JobId, JobState, WorkerId};
use batch_fetch_queue::services::checker::{ItemChecker, MockItemChecker};
use batch_fetch_queue::services::dispatcher::Dispatcher;
use batch_fetch_queue::services::status::{StatusError, StatusProjector};
use batch_fetch_queue::services::worker::{JobOutcome, Worker, WorkerPool};
use batch_fetch_queue::store::{ClaimRequest, InMemoryJobStore, JobStore};

const POLL_INTERVAL: Duration = Duration::from_millis(2);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

fn claim_request(worker: &str) -> ClaimRequest {
    ClaimRequest {
        worker_id: WorkerId::new(worker),
        lease: chrono::Duration::seconds(30),
        max_attempts: 3,
    }
}

async fn submit(dispatcher: &Dispatcher, item_ids: &[u64]) -> JobId {
    dispatcher
        .submit(SubmitJobRequest {
            item_ids: item_ids.to_vec(),
            job_id: None,
        })
        .await
        .expect("valid submission")
        .job_id
}

#[tokio::test]
async fn test_submitted_job_is_immediately_queued() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let projector = StatusProjector::new(store.clone());

    let job_id = submit(&dispatcher, &[70000, 70007]).await;
    let status = projector.status(job_id).await.expect("status");

    assert_eq!(status.status, ExternalState::Queued);
    assert_eq!(status.progress, 0);
    assert_eq!(status.total_items, 2);
    assert!(status.result.is_none());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let projector = StatusProjector::new(InMemoryJobStore::arc());
    let err = projector.status(JobId::new()).await.unwrap_err();
    assert!(matches!(err, StatusError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_fixtures_reach_expected_terminal_status() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let projector = StatusProjector::new(store.clone());
    let pool = WorkerPool::new(
        store.clone(),
        Arc::new(MockItemChecker::default()),
        fast_worker_config(3, 3),
    )
    .spawn(CancellationToken::new());

    for fixture in BATCH_FIXTURES {
        let job_id = submit(&dispatcher, fixture.item_ids).await;
        let observed = poll_until_terminal(&projector, job_id, POLL_INTERVAL, POLL_TIMEOUT).await;
        let last = observed.last().expect("at least one poll");

        let status = serde_json::to_value(last.status).unwrap();
        assert_eq!(status, fixture.expected_status, "{}", fixture.name);
        assert_eq!(last.progress, 100, "{}", fixture.name);

        let result = last.result.as_ref().expect("terminal result");
        assert_eq!(result.success_count, fixture.success_count, "{}", fixture.name);
        assert_eq!(result.failed_count, fixture.failed_count, "{}", fixture.name);
        assert_eq!(
            result.download_urls.len() as u32,
            fixture.success_count,
            "{}",
            fixture.name
        );
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_all_available_scenario_produces_download_urls() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let projector = StatusProjector::new(store.clone());
    let worker = Worker::new(
        WorkerId::new("w-0"),
        store.clone(),
        Arc::new(MockItemChecker::default()),
        fast_worker_config(1, 3),
    );

    let job_id = submit(&dispatcher, &[70000, 70007, 70014]).await;
    let outcome = worker.run_once().await.expect("store ok");
    assert_eq!(
        outcome,
        Some(JobOutcome::Completed {
            success_count: 3,
            failed_count: 0
        })
    );

    let status = projector.status(job_id).await.unwrap();
    assert_eq!(status.status, ExternalState::Completed);
    let result = status.result.unwrap();
    assert_eq!(result.success_count, 3);
    assert_eq!(result.failed_count, 0);
    assert_eq!(
        result.download_urls,
        vec![
            "https://downloads.example.com/files/70000.bin",
            "https://downloads.example.com/files/70007.bin",
            "https://downloads.example.com/files/70014.bin",
        ]
    );
}

#[tokio::test]
async fn test_unavailable_scenario_fails_with_business_reason() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let worker = Worker::new(
        WorkerId::new("w-0"),
        store.clone(),
        Arc::new(MockItemChecker::default()),
        fast_worker_config(1, 3),
    );

    let job_id = submit(&dispatcher, &[70001]).await;
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::AllUnavailable { failed_count: 1 }));

    let record = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts, 1);
    let result = record.result.unwrap();
    assert_eq!(result.success_count, 0);
    assert_eq!(result.failed_count, 1);
    assert!(!result.message.contains("Retries exhausted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_workers_racing_for_one_job() {
    for _ in 0..50 {
        let store = InMemoryJobStore::arc();
        let job_id = store
            .create(JobDefinition::new(JobId::new(), vec![7]))
            .await
            .unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.claim(&claim_request("a")).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.claim(&claim_request("b")).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        let winners: Vec<_> = [a, b].into_iter().flatten().collect();
        assert_eq!(winners.len(), 1, "exactly one worker must win the claim");
        assert_eq!(winners[0].id(), job_id);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_claims_never_share_a_job() {
    const WORKERS: usize = 8;
    const JOBS: usize = 200;

    let store = InMemoryJobStore::arc();
    for i in 0..JOBS {
        store
            .create(JobDefinition::new(JobId::new(), vec![i as u64 + 1]))
            .await
            .unwrap();
    }

    let claimers = (0..WORKERS).map(|w| {
        let store = store.clone();
        tokio::spawn(async move {
            let request = claim_request(&format!("w-{}", w));
            let mut claimed = Vec::new();
            while let Some(record) = store.claim(&request).await.unwrap() {
                assert_eq!(record.claimed_by.as_ref(), Some(&request.worker_id));
                claimed.push(record.id());
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    for claimed in futures::future::join_all(claimers).await {
        for id in claimed.unwrap() {
            assert!(seen.insert(id), "job {} claimed by two workers", id);
        }
    }
    assert_eq!(seen.len(), JOBS);
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_always_failing_checker_exhausts_exact_attempt_budget() {
    const MAX_ATTEMPTS: u32 = 3;

    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let projector = StatusProjector::new(store.clone());
    let checker = Arc::new(BrokenChecker::default());
    let pool = WorkerPool::new(
        store.clone(),
        checker.clone(),
        fast_worker_config(2, MAX_ATTEMPTS),
    )
    .spawn(CancellationToken::new());

    let job_id = submit(&dispatcher, &[70000, 70007]).await;
    let observed = poll_until_terminal(&projector, job_id, POLL_INTERVAL, POLL_TIMEOUT).await;
    pool.shutdown().await;

    let last = observed.last().unwrap();
    assert_eq!(last.status, ExternalState::Failed);
    assert_eq!(last.progress, 100);
    let result = last.result.as_ref().unwrap();
    assert!(
        result.message.contains("Retries exhausted after 3 attempts"),
        "unexpected message: {}",
        result.message
    );
    assert_eq!(result.failed_count, 2);

    // The first item fails on every attempt, so the checker runs once per attempt.
    assert_eq!(checker.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);

    let record = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.attempts, MAX_ATTEMPTS);
    assert_eq!(record.definition.item_ids, vec![70000, 70007]);
}

#[tokio::test]
async fn test_transient_failure_is_retried_after_backoff() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let config = fast_worker_config(1, 3);
    let worker = Worker::new(
        WorkerId::new("w-0"),
        store.clone(),
        Arc::new(FlakyChecker::new(1)),
        config.clone(),
    );

    let job_id = submit(&dispatcher, &[7, 14]).await;

    let first = worker.run_once().await.unwrap();
    assert_eq!(
        first,
        Some(JobOutcome::Retrying {
            attempt: 1,
            delay: config.retry.delay(1)
        })
    );
    let record = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Active);
    assert_eq!(record.last_error.as_deref(), Some("Item check failed: temporary outage"));

    // Still backing off.
    assert_eq!(worker.run_once().await.unwrap(), None);

    tokio::time::sleep(config.retry.delay(1) + Duration::from_millis(10)).await;
    let second = worker.run_once().await.unwrap();
    assert_eq!(
        second,
        Some(JobOutcome::Completed {
            success_count: 2,
            failed_count: 0
        })
    );
    let record = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_that_loses_its_lease_abandons_the_job() {
    let store = InMemoryJobStore::arc();
    let job_id = store
        .create(JobDefinition::new(JobId::new(), vec![7]))
        .await
        .unwrap();

    let mut config = fast_worker_config(1, 3);
    config.lease = Duration::from_millis(50);
    let slow = Worker::new(
        WorkerId::new("slow"),
        store.clone(),
        SlowChecker::new(Duration::from_millis(150)),
        config,
    );
    let slow = tokio::spawn(async move { slow.run_once().await });

    tokio::time::sleep(Duration::from_millis(80)).await;
    let takeover = store
        .claim(&claim_request("fast"))
        .await
        .unwrap()
        .expect("lapsed lease is claimable");
    assert_eq!(takeover.id(), job_id);
    assert_eq!(takeover.attempts, 2);

    let outcome = slow.await.unwrap().unwrap();
    assert_eq!(outcome, Some(JobOutcome::Abandoned));

    let record = store.get(job_id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Active);
    assert_eq!(record.claimed_by, Some(WorkerId::new("fast")));
    assert!(record.result.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_polled_progress_is_monotonic() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let projector = StatusProjector::new(store.clone());
    let pool = WorkerPool::new(
        store.clone(),
        SlowChecker::new(Duration::from_millis(2)),
        fast_worker_config(2, 3),
    )
    .spawn(CancellationToken::new());

    let item_ids: Vec<u64> = (1..=60).collect();
    let job_id = submit(&dispatcher, &item_ids).await;
    let observed =
        poll_until_terminal(&projector, job_id, Duration::from_millis(1), POLL_TIMEOUT).await;
    pool.shutdown().await;

    for pair in observed.windows(2) {
        assert!(
            pair[0].progress <= pair[1].progress,
            "progress went backwards: {} -> {}",
            pair[0].progress,
            pair[1].progress
        );
    }
    let last = observed.last().unwrap();
    assert_eq!(last.status, ExternalState::Completed);
    assert_eq!(last.progress, 100);
}

#[tokio::test]
async fn test_projection_has_no_side_effects() {
    let store = InMemoryJobStore::arc();
    let dispatcher = Dispatcher::new(store.clone(), ItemIdBounds::default());
    let projector = StatusProjector::new(store.clone());
    let job_id = submit(&dispatcher, &[7]).await;

    let first = projector.status(job_id).await.unwrap();
    let second = projector.status(job_id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        store.get(job_id).await.unwrap().unwrap().state,
        JobState::Queued
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_item_is_counted_exactly_once(item_ids in prop::collection::vec(1u64..100_000, 1..40)) {
        let (success, failed, expected_success) = tokio_test::block_on(async {
            let store = InMemoryJobStore::arc();
            let checker = MockItemChecker::default();
            let worker = Worker::new(
                WorkerId::new("w-0"),
                store.clone(),
                Arc::new(checker.clone()),
                fast_worker_config(1, 3),
            );
            let job_id = store
                .create(JobDefinition::new(JobId::new(), item_ids.clone()))
                .await
                .unwrap();
            worker.run_once().await.unwrap();

            let mut expected_success = 0u32;
            for id in &item_ids {
                if checker.check(*id).await.unwrap().available {
                    expected_success += 1;
                }
            }

            let result = store.get(job_id).await.unwrap().unwrap().result.unwrap();
            (result.success_count, result.failed_count, expected_success)
        });

        prop_assert_eq!(success + failed, item_ids.len() as u32);
        prop_assert_eq!(success, expected_success);
    }
}
