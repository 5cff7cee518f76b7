mod common;

use std::sync::Arc;
use std::time::Duration;

use jobqueue_config::CircuitBreakerSettings;
use jobqueue_domain::{JobStatus, JobType, Stores};
use jobqueue_infrastructure::{CircuitBreakerRegistry, InMemoryStore};
use jobqueue_worker::{simulated_registry, ExecutionOutcome, WorkerLifecycle, WorkerSettings};
use serde_json::json;
use tokio::sync::broadcast;

use common::{fast_retry_scheduler, submit};

fn settings(max_jobs: u64) -> WorkerSettings {
    WorkerSettings {
        job_types: vec![JobType::Migration, JobType::Backtest],
        poll_interval: Duration::from_millis(5),
        max_poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(10),
        job_timeout: Duration::from_secs(5),
        max_jobs,
        error_backoff: Duration::from_millis(10),
    }
}

fn worker(stores: &Stores, worker_id: &str, max_jobs: u64) -> WorkerLifecycle {
    WorkerLifecycle::new(
        worker_id.to_string(),
        settings(max_jobs),
        stores.clone(),
        Arc::new(simulated_registry(Duration::from_millis(1))),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
        fast_retry_scheduler(),
    )
}

#[tokio::test]
async fn test_poll_once_alternates_job_types() {
    let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
    submit(&stores, "m-1", JobType::Migration, json!({}), 3).await;
    submit(&stores, "m-2", JobType::Migration, json!({}), 3).await;
    submit(&stores, "b-1", JobType::Backtest, json!({}), 3).await;

    let worker = worker(&stores, "w-rr", 0);
    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));

    // 第二次轮询应从backtest开始
    let b = stores.jobs.get("b-1").await.unwrap().unwrap();
    assert_eq!(b.status, JobStatus::Completed);
    let m2 = stores.jobs.get("m-2").await.unwrap().unwrap();
    assert_eq!(m2.status, JobStatus::Queued);

    assert_eq!(worker.poll_once().await.unwrap(), Some(ExecutionOutcome::Completed));
    assert_eq!(worker.poll_once().await.unwrap(), None);
    assert_eq!(worker.jobs_processed(), 3);
}

#[tokio::test]
async fn test_run_stops_after_job_budget() {
    let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
    for i in 0..3 {
        submit(&stores, &format!("m-{i}"), JobType::Migration, json!({}), 3).await;
    }

    let worker = worker(&stores, "w-budget", 2);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let processed = tokio::time::timeout(Duration::from_secs(5), worker.run(shutdown_rx))
        .await
        .unwrap();

    assert_eq!(processed, 2);
    assert_eq!(stores.queue.depth(JobType::Migration).await.unwrap(), 1);
    assert!(!worker.is_running().await);
    // 退出时删除心跳记录
    assert!(stores.heartbeats.get("w-budget").await.unwrap().is_none());
}

#[tokio::test]
async fn test_run_emits_heartbeats_and_honors_shutdown() {
    let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
    let worker = Arc::new(worker(&stores, "w-idle", 0));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let running = Arc::clone(&worker);
    let handle = tokio::spawn(async move { running.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(60)).await;
    let heartbeat = stores.heartbeats.get("w-idle").await.unwrap().unwrap();
    assert!(heartbeat.current_job_id.is_none());
    assert!(worker.is_running().await);

    shutdown_tx.send(()).unwrap();
    let processed = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(processed, 0);
}

#[tokio::test]
async fn test_run_processes_retries_when_promoted() {
    let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
    submit(&stores, "b-flaky", JobType::Backtest, json!({"fail_attempts": 1}), 3).await;

    let worker = Arc::new(worker(&stores, "w-retry", 0));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = Arc::clone(&worker);
    let handle = tokio::spawn(async move { running.run(shutdown_rx).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        stores.queue.promote_due(chrono::Utc::now()).await.unwrap();
        let job = stores.jobs.get("b-flaky").await.unwrap().unwrap();
        if job.status == JobStatus::Completed {
            assert_eq!(job.attempt, 2);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job did not complete in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).unwrap();
    let processed = handle.await.unwrap();
    // 一次重试加一次完成
    assert_eq!(processed, 2);
}
