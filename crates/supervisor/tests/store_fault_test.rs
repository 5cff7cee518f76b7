mod common;

use chrono::Utc;
use common::{after_dead_timeout, registry, worker, FaultyStore, DEAD_TIMEOUT};
use jobqueue_config::JobsConfig;
use jobqueue_domain::{JobStatus, JobType, JobUpdate, WorkerHeartbeat};
use jobqueue_supervisor::{JobService, SubmitJobRequest};
use jobqueue_worker::ExecutionOutcome;
use serde_json::json;

#[tokio::test]
async fn test_store_error_after_claim_releases_job() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    let job = service
        .submit_job(SubmitJobRequest::new(JobType::Migration, json!({"run": 1})).with_job_id("mig-release"))
        .await
        .unwrap();

    store.fail_next("is_cancel_requested", 1);
    let worker = worker(&stores, "w-1");
    let err = worker.poll_once().await.unwrap_err();
    assert!(err.is_store_unavailable());

    let released = service.get_job(&job.job_id).await.unwrap();
    assert_eq!(released.status, JobStatus::Queued);
    assert!(released.owner_worker_id.is_empty());
    assert!(released.message.starts_with("released after store error"));
    assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);

    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
    let finished = service.get_job(&job.job_id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.attempt, 2);
}

#[tokio::test]
async fn test_store_error_on_claim_restores_entry() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    service
        .submit_job(SubmitJobRequest::new(JobType::Migration, json!({})).with_job_id("mig-claim"))
        .await
        .unwrap();

    store.fail_next("transition", 1);
    let worker = worker(&stores, "w-1");
    assert!(worker.poll_once().await.is_err());

    let job = service.get_job("mig-claim").await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 0);
    assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);

    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
    assert_eq!(service.get_job("mig-claim").await.unwrap().attempt, 1);
}

#[tokio::test]
async fn test_store_error_on_lookup_restores_entry() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    service
        .submit_job(SubmitJobRequest::new(JobType::Backtest, json!({})).with_job_id("bt-lookup"))
        .await
        .unwrap();

    store.fail_next("get_job", 1);
    let worker = worker(&stores, "w-1");
    assert!(worker.poll_once().await.is_err());
    assert_eq!(stores.queue.depth(JobType::Backtest).await.unwrap(), 1);

    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
}

#[tokio::test]
async fn test_failed_schedule_falls_back_to_ready_queue() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    service
        .submit_job(
            SubmitJobRequest::new(JobType::Backtest, json!({"fail_attempts": 1}))
                .with_job_id("bt-schedule"),
        )
        .await
        .unwrap();

    store.fail_always("schedule");
    let worker = worker(&stores, "w-1");
    assert_eq!(
        worker.poll_once().await.unwrap(),
        Some(ExecutionOutcome::Retried { delay: std::time::Duration::ZERO })
    );
    assert_eq!(stores.queue.depth(JobType::Backtest).await.unwrap(), 1);
    assert_eq!(stores.queue.delayed_depth().await.unwrap(), 0);

    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
    assert_eq!(service.get_job("bt-schedule").await.unwrap().attempt, 2);
}

#[tokio::test]
async fn test_queued_job_without_queue_entry_is_restored_by_scan() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    service
        .submit_job(
            SubmitJobRequest::new(JobType::Backtest, json!({"fail_attempts": 1}))
                .with_job_id("bt-orphan"),
        )
        .await
        .unwrap();

    store.fail_always("schedule");
    store.fail_always("enqueue");
    let worker = worker(&stores, "w-1");
    assert!(worker.poll_once().await.is_err());

    // 状态已回到queued，但既不在就绪队列也不在延迟集合
    let job = service.get_job("bt-orphan").await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(stores.queue.depth(JobType::Backtest).await.unwrap(), 0);
    assert_eq!(stores.queue.delayed_depth().await.unwrap(), 0);

    store.heal("schedule");
    store.heal("enqueue");
    let registry = registry(&stores);
    assert!(registry.scan_once(Utc::now()).await.unwrap().restored_queue.is_empty());

    let report = registry.scan_once(after_dead_timeout()).await.unwrap();
    assert_eq!(report.restored_queue, vec!["bt-orphan"]);
    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
}

#[tokio::test]
async fn test_dead_job_without_dlq_entry_is_restored_by_scan() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    service
        .submit_job(
            SubmitJobRequest::new(JobType::Migration, json!({"always_fail": true}))
                .with_job_id("mig-dead")
                .with_max_attempts(1),
        )
        .await
        .unwrap();

    store.fail_always("push");
    let worker = worker(&stores, "w-1");
    assert!(worker.poll_once().await.is_err());
    assert_eq!(service.get_job("mig-dead").await.unwrap().status, JobStatus::Dead);
    assert!(service.list_dlq().await.unwrap().is_empty());

    store.heal("push");
    let report = registry(&stores).scan_once(Utc::now()).await.unwrap();
    assert_eq!(report.restored_dlq, vec!["mig-dead"]);

    let dlq = service.list_dlq().await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].attempts, 1);
    assert!(dlq[0].reason.contains("simulated transient failure"));
}

#[tokio::test]
async fn test_failed_enqueue_after_reclaim_is_restored_by_scan() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);
    service
        .submit_job(SubmitJobRequest::new(JobType::Migration, json!({})).with_job_id("mig-reclaim"))
        .await
        .unwrap();

    stores.queue.dequeue(JobType::Migration).await.unwrap().unwrap();
    stores
        .jobs
        .transition("mig-reclaim", &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim("w-crashed"))
        .await
        .unwrap();
    let mut heartbeat = WorkerHeartbeat::new("w-crashed");
    heartbeat.last_seen = Utc::now() - chrono::Duration::seconds(30);
    stores.heartbeats.record(&heartbeat).await.unwrap();

    store.fail_always("enqueue");
    let registry = registry(&stores);
    let report = registry.scan_once(Utc::now()).await.unwrap();
    assert_eq!(report.requeued, vec!["mig-reclaim"]);
    assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 0);

    store.heal("enqueue");
    let report = registry.scan_once(after_dead_timeout()).await.unwrap();
    assert_eq!(report.restored_queue, vec!["mig-reclaim"]);
    assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unmarked_submit_failure_is_restored_by_scan() {
    let store = FaultyStore::new();
    let stores = store.stores();
    let service = JobService::new(stores.clone(), JobsConfig::default(), DEAD_TIMEOUT);

    store.fail_always("enqueue");
    store.fail_always("transition");
    assert!(service
        .submit_job(SubmitJobRequest::new(JobType::Migration, json!({})).with_job_id("mig-submit"))
        .await
        .is_err());
    assert_eq!(service.get_job("mig-submit").await.unwrap().status, JobStatus::Queued);

    store.heal("enqueue");
    store.heal("transition");
    let report = registry(&stores).scan_once(after_dead_timeout()).await.unwrap();
    assert_eq!(report.restored_queue, vec!["mig-submit"]);

    let worker = worker(&stores, "w-1");
    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
}
