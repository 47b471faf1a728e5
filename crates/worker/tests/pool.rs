use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use plenum_core::config::WorkerConfig;
use plenum_queue::MemoryQueue;
use plenum_tickets::{JobClient, JobRequest, MemoryTicketStore, StatusKind, TicketId, TicketStore};
use plenum_worker::{
    Claimer, Dispatch, LogOnlyProtection, MemoryWorkerRegistry, Outcome, WorkerError, WorkerPool, WorkerRegistry,
};

struct Slow(Duration);

#[async_trait]
impl Dispatch for Slow {
    async fn dispatch(&self, request: &JobRequest) -> Result<Outcome, WorkerError> {
        tokio::time::sleep(self.0).await;
        Ok(Outcome::done(json!({ "echo": request.endpoint })))
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        workers: 2,
        idle_wait_secs: 1,
        heartbeat_secs: 1,
        shutdown_timeout_secs: 5,
        ..WorkerConfig::default()
    }
}

async fn wait_for_terminal(store: &MemoryTicketStore, tickets: &[TicketId]) {
    for _ in 0..100 {
        let mut done = 0;
        for ticket in tickets {
            if store.get_status(ticket).await.unwrap().status.is_terminal() {
                done += 1;
            }
        }
        if done == tickets.len() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("tickets did not finish in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_drains_queue_and_deregisters_on_shutdown() {
    let store = Arc::new(MemoryTicketStore::default());
    let queue = Arc::new(MemoryQueue::new(300));
    let registry = Arc::new(MemoryWorkerRegistry::new());
    let protection = Arc::new(LogOnlyProtection::new());
    let jobs = JobClient::new(store.clone(), queue.clone());

    let mut tickets = Vec::new();
    for i in 0..6 {
        tickets.push(jobs.submit_request(&JobRequest::new(format!("job_{i}"))).await.unwrap());
    }

    let claimer = Claimer::new(store.clone(), queue.clone(), Arc::new(Slow(Duration::from_millis(50))), &config());
    let pool = WorkerPool::new(claimer, registry.clone(), protection.clone(), config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool.run(shutdown_rx));

    wait_for_terminal(&store, &tickets).await;
    assert!(queue.is_empty());

    let workers = registry.list().await.unwrap();
    assert_eq!(workers.len(), 2);
    let mut claimed_by = Vec::new();
    for ticket in &tickets {
        let status = store.get_status(ticket).await.unwrap();
        assert_eq!(status.status, StatusKind::Success);
        claimed_by.extend(status.meta.workers);
    }
    assert!(claimed_by.iter().all(|w| workers.iter().any(|r| &r.name == w)));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("pool stops")
        .unwrap()
        .unwrap();

    assert!(registry.list().await.unwrap().is_empty());
    assert_eq!(protection.current(), Some(false));
}

#[tokio::test]
async fn pool_stops_when_shutdown_sender_is_dropped() {
    let store = Arc::new(MemoryTicketStore::default());
    let queue = Arc::new(MemoryQueue::new(300));
    let registry = Arc::new(MemoryWorkerRegistry::new());

    let claimer = Claimer::new(store, queue, Arc::new(Slow(Duration::from_millis(50))), &config());
    let pool = WorkerPool::new(claimer, registry.clone(), Arc::new(LogOnlyProtection::new()), config());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("pool stops")
        .unwrap()
        .unwrap();
    assert!(registry.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_a_job_that_outlives_the_timeout() {
    let store = Arc::new(MemoryTicketStore::default());
    let queue = Arc::new(MemoryQueue::new(300));
    let registry = Arc::new(MemoryWorkerRegistry::new());
    let jobs = JobClient::new(store.clone(), queue.clone());
    let config = WorkerConfig {
        workers: 1,
        shutdown_timeout_secs: 1,
        ..config()
    };

    let ticket = jobs.submit_request(&JobRequest::new("rebuild")).await.unwrap();
    let claimer = Claimer::new(store.clone(), queue.clone(), Arc::new(Slow(Duration::from_secs(3))), &config);
    let pool = WorkerPool::new(claimer, registry.clone(), Arc::new(LogOnlyProtection::new()), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(pool.run(shutdown_rx));

    for _ in 0..100 {
        if store.get_status(&ticket).await.unwrap().status == StatusKind::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.get_status(&ticket).await.unwrap().status, StatusKind::Processing);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("pool stops")
        .unwrap()
        .unwrap();

    assert_eq!(store.get_status(&ticket).await.unwrap().status, StatusKind::Success);
    assert!(queue.is_empty());
    assert!(registry.list().await.unwrap().is_empty());
}
