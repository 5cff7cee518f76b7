#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobqueue_config::CircuitBreakerSettings;
use jobqueue_domain::{Job, JobType, QueueEntry, RetryPolicy, RetryScheduler, Stores};
use jobqueue_infrastructure::{CircuitBreakerRegistry, InMemoryStore};
use jobqueue_worker::{simulated_registry, JobExecutionManager, WorkerState};

pub struct Harness {
    pub stores: Stores,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub state: Arc<WorkerState>,
    pub executor: JobExecutionManager,
}

pub fn fast_retry_scheduler() -> Arc<RetryScheduler> {
    Arc::new(RetryScheduler::new(RetryPolicy {
        base_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(100),
        jitter_factor: 0.0,
    }))
}

pub fn harness(job_timeout: Duration) -> Harness {
    let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default()));
    let state = Arc::new(WorkerState::new());
    let executor = JobExecutionManager::new(
        "worker-test".to_string(),
        stores.clone(),
        Arc::new(simulated_registry(Duration::from_millis(1))),
        Arc::clone(&breakers),
        fast_retry_scheduler(),
        job_timeout,
        Arc::clone(&state),
    );

    Harness {
        stores,
        breakers,
        state,
        executor,
    }
}

pub async fn submit(
    stores: &Stores,
    id: &str,
    job_type: JobType,
    payload: serde_json::Value,
    max_attempts: u32,
) {
    stores
        .jobs
        .create(&Job::new(id.to_string(), job_type, payload, max_attempts))
        .await
        .unwrap();
    stores.queue.enqueue(job_type, id).await.unwrap();
}

pub async fn pop(stores: &Stores, job_type: JobType) -> QueueEntry {
    stores.queue.dequeue(job_type).await.unwrap().unwrap()
}
