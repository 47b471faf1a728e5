use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use plenum_core::config::{EtlConfig, WorkerConfig};
use plenum_etl::{DatasetStore, MemoryDatasetStore, MemoryMetaStore, MetaStore, SyncEngine};
use plenum_queue::{DurableQueue, MemoryQueue};
use plenum_tickets::{
    claim_transition, JobClient, JobRequest, MemoryTicketStore, StatusKind, TicketId, TicketStore,
};
use plenum_worker::{
    Claimer, Dispatch, DispatchTable, Disposition, MemoryWorkerRegistry, Outcome, Registration, WorkerError,
};

const FIXTURE: &str = include_str!("fixtures/fixture.csv");

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        defer_timeout_secs: 0,
        ..WorkerConfig::default()
    }
}

/// Returns scripted outcomes in order, then `Done("ok")`.
#[derive(Default)]
struct Scripted {
    outcomes: Mutex<VecDeque<Result<Outcome, String>>>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(outcomes: Vec<Result<Outcome, String>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatch for Scripted {
    async fn dispatch(&self, request: &JobRequest) -> Result<Outcome, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.endpoint == "explode" {
            panic!("handler blew up");
        }
        match self.outcomes.lock().unwrap().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(reason)) => Err(WorkerError::InvalidParams {
                endpoint: request.endpoint.clone(),
                reason,
            }),
            None => Ok(Outcome::done(json!("ok"))),
        }
    }
}

struct Harness {
    store: Arc<MemoryTicketStore>,
    queue: Arc<MemoryQueue>,
    jobs: JobClient,
    registry: Arc<MemoryWorkerRegistry>,
    claimer: Claimer,
    registration: Registration,
}

impl Harness {
    async fn new(dispatch: Arc<dyn Dispatch>) -> Self {
        let store = Arc::new(MemoryTicketStore::default());
        let queue = Arc::new(MemoryQueue::new(300));
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let claimer = Claimer::new(store.clone(), queue.clone(), dispatch, &worker_config());
        let registration = Registration::acquire(registry.clone()).await.unwrap();
        Self {
            jobs: JobClient::new(store.clone(), queue.clone()),
            store,
            queue,
            registry,
            claimer,
            registration,
        }
    }

    async fn submit(&self, endpoint: &str, query: &[(&str, &str)]) -> TicketId {
        let query: BTreeMap<String, String> = query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.jobs.submit(endpoint, query).await.unwrap()
    }

    async fn next(&self) -> Disposition {
        let message = self.queue.poll().await.unwrap().expect("a visible message");
        self.claimer
            .process_message(&self.registration, &message)
            .await
            .unwrap()
    }

    async fn result(&self, ticket: &TicketId) -> Value {
        self.store.get_result(ticket).await.unwrap()
    }
}

struct EtlHarness {
    inner: Harness,
    datasets: Arc<MemoryDatasetStore>,
    meta: Arc<MemoryMetaStore>,
    _dir: TempDir,
    source: PathBuf,
}

impl EtlHarness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("fixture.csv");
        std::fs::write(&source, FIXTURE).unwrap();

        let store = Arc::new(MemoryTicketStore::default());
        let queue = Arc::new(MemoryQueue::new(300));
        let registry = Arc::new(MemoryWorkerRegistry::new());
        let datasets = Arc::new(MemoryDatasetStore::new());
        let meta = Arc::new(MemoryMetaStore::new());

        let jobs = JobClient::new(store.clone(), queue.clone());
        let engine = SyncEngine::new(datasets.clone(), meta.clone(), &EtlConfig::default());
        let table = DispatchTable::new(engine, store.clone(), jobs.clone(), &EtlConfig::default(), &worker_config());
        let claimer = Claimer::new(store.clone(), queue.clone(), Arc::new(table), &worker_config());
        let registration = Registration::acquire(registry.clone()).await.unwrap();

        Self {
            inner: Harness {
                store,
                queue,
                jobs,
                registry,
                claimer,
                registration,
            },
            datasets,
            meta,
            _dir: dir,
            source,
        }
    }

    fn url(&self) -> String {
        self.source.to_string_lossy().into_owned()
    }
}

// ── End to end through the dispatch table ─────────────────────

#[tokio::test]
async fn add_dataset_by_url_ingests_the_fixture() {
    let h = EtlHarness::new().await;
    let url = h.url();
    let ticket = h.inner.submit("add_dataset", &[("url", url.as_str())]).await;

    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Success));

    assert_eq!(h.datasets.row_count("fixture").await.unwrap(), 4);
    let meta = h.meta.get("fixture").await.unwrap().unwrap();
    let day = |d| chrono::NaiveDate::from_ymd_opt(2015, 1, d).unwrap();
    assert_eq!(meta.obs_from.map(|t| t.date()), Some(day(3)));
    assert_eq!(meta.obs_to.map(|t| t.date()), Some(day(12)));

    let status = h.inner.store.get_status(&ticket).await.unwrap();
    assert_eq!(status.status, StatusKind::Success);
    assert_eq!(status.meta.tries, 1);
    assert_eq!(status.meta.workers, vec![h.inner.registration.name().to_string()]);
    assert!(status.meta.end_time.is_some());

    let result = h.inner.result(&ticket).await;
    assert_eq!(result["total_rows"], 4);
    assert_eq!(result["dataset"], "fixture");

    assert!(h.inner.queue.is_empty());
    let row = h.inner.registry.get(h.inner.registration.name()).unwrap();
    assert!(row.active_ticket.is_none(), "claim released after the job");
    assert!(!h.inner.registration.is_busy());
}

#[tokio::test]
async fn fields_and_meta_read_the_master_index() {
    let h = EtlHarness::new().await;
    let url = h.url();
    h.inner.submit("add_dataset", &[("url", url.as_str())]).await;
    h.inner.next().await;

    let fields = h.inner.submit("fields", &[("dataset_name", "fixture")]).await;
    let meta = h.inner.submit("meta", &[]).await;
    h.inner.next().await;
    h.inner.next().await;

    let fields = h.inner.result(&fields).await;
    assert_eq!(fields["fields"][2], json!({ "name": "date", "type": "timestamp" }));
    let meta = h.inner.result(&meta).await;
    assert_eq!(meta.as_array().unwrap().len(), 1);
    assert_eq!(meta[0]["dataset_name"], "fixture");
}

#[tokio::test]
async fn update_after_source_change_applies_the_diff() {
    let h = EtlHarness::new().await;
    let url = h.url();
    h.inner.submit("add_dataset", &[("url", url.as_str())]).await;
    h.inner.next().await;

    std::fs::write(&h.source, FIXTURE.replace("ASSAULT", "ROBBERY")).unwrap();
    let ticket = h.inner.submit("update_dataset", &[("dataset_name", "fixture")]).await;
    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Success));

    let result = h.inner.result(&ticket).await;
    assert_eq!((result["inserted"].as_u64(), result["deleted"].as_u64()), (Some(1), Some(1)));
    assert_eq!(h.datasets.row_count("fixture").await.unwrap(), 4);
}

#[tokio::test]
async fn locked_dataset_defers_then_completes() {
    let h = EtlHarness::new().await;
    assert!(h.inner.store.try_set_flag("etl:fixture", 60).await.unwrap());

    let url = h.url();
    let ticket = h.inner.submit("add_dataset", &[("url", url.as_str())]).await;
    assert_eq!(h.inner.next().await, Disposition::Deferred);

    let status = h.inner.store.get_status(&ticket).await.unwrap();
    assert_eq!(status.status, StatusKind::Queued);
    assert!(status.meta.last_deferred_time.is_some());
    assert!(h.meta.get("fixture").await.unwrap().is_none(), "nothing ran under the lock");
    assert_eq!(h.inner.queue.visible_len(), 1);

    h.inner.store.clear_flag("etl:fixture").await.unwrap();
    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Success));
    let status = h.inner.store.get_status(&ticket).await.unwrap();
    assert_eq!(status.meta.tries, 2);
    assert!(status.meta.last_resume_time.is_some());

    // The job released its lock.
    assert!(h.inner.store.try_set_flag("etl:fixture", 60).await.unwrap());
}

#[tokio::test]
async fn frequency_update_schedules_due_datasets() {
    let h = EtlHarness::new().await;
    let url = h.url();
    h.inner
        .submit("add_dataset", &[("url", url.as_str()), ("update_freq", "daily")])
        .await;
    h.inner.next().await;

    let ticket = h.inner.submit("frequency_update", &[("frequency", "daily")]).await;
    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Success));
    let result = h.inner.result(&ticket).await;
    assert_eq!(result["submitted"].as_array().unwrap().len(), 1);

    let scheduled: TicketId = result["submitted"][0]["ticket"].as_str().unwrap().parse().unwrap();
    let request = h.inner.store.get_request(&scheduled).await.unwrap();
    assert_eq!(request, JobRequest::new("update_dataset").with("dataset_name", "fixture"));

    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Success));
    assert_eq!(h.inner.result(&scheduled).await["inserted"], 0);
}

#[tokio::test]
async fn unknown_frequency_fails_the_ticket() {
    let h = EtlHarness::new().await;
    let ticket = h.inner.submit("frequency_update", &[("frequency", "hourly")]).await;
    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Error));
    assert!(h.inner.result(&ticket).await["error"].as_str().unwrap().contains("hourly"));
}

#[tokio::test]
async fn unknown_endpoint_is_finalized_as_error() {
    let h = EtlHarness::new().await;
    let ticket = h.inner.submit("drop_all_tables", &[]).await;

    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Error));
    let error = h.inner.result(&ticket).await;
    assert!(error["error"].as_str().unwrap().contains("unknown endpoint"));
    assert!(h.inner.queue.is_empty());
}

#[tokio::test]
async fn invalid_params_are_finalized_as_error() {
    let h = EtlHarness::new().await;
    let ticket = h.inner.submit("update_dataset", &[("name", "fixture")]).await;

    assert_eq!(h.inner.next().await, Disposition::Finalized(StatusKind::Error));
    assert!(h.inner.result(&ticket).await["error"]
        .as_str()
        .unwrap()
        .contains("dataset_name"));
}

// ── Claim protocol ────────────────────────────────────────────

#[tokio::test]
async fn malformed_ticket_id_is_discarded_without_store_writes() {
    let h = Harness::new(Arc::new(Scripted::default())).await;
    h.queue.enqueue("not-a-ticket").await.unwrap();

    assert_eq!(h.next().await, Disposition::Discarded);
    assert!(h.queue.is_empty());
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn unknown_ticket_is_discarded() {
    let h = Harness::new(Arc::new(Scripted::default())).await;
    h.queue.enqueue(TicketId::generate().as_str()).await.unwrap();

    assert_eq!(h.next().await, Disposition::Discarded);
    assert!(h.queue.is_empty());
    assert_eq!(h.store.record_count(), 0);
}

#[tokio::test]
async fn corrupt_status_is_discarded_untouched() {
    let dispatch = Arc::new(Scripted::default());
    let h = Harness::new(dispatch.clone()).await;
    let ticket = h.submit("ping", &[]).await;
    let key = h.store.keys().status(&ticket);
    h.store.put_raw(&key, "{\"status\":");

    assert_eq!(h.next().await, Disposition::Discarded);
    assert_eq!(dispatch.calls(), 0);
    assert!(h.store.get_status(&ticket).await.unwrap_err().is_poison());
}

#[tokio::test]
async fn finished_ticket_is_never_executed_again() {
    let dispatch = Arc::new(Scripted::default());
    let h = Harness::new(dispatch.clone()).await;
    let ticket = h.submit("ping", &[]).await;
    assert_eq!(h.next().await, Disposition::Finalized(StatusKind::Success));
    let finished = h.store.get_status(&ticket).await.unwrap();

    // Redelivery of the same ticket.
    h.queue.enqueue(ticket.as_str()).await.unwrap();
    assert_eq!(h.next().await, Disposition::Discarded);

    assert_eq!(dispatch.calls(), 1);
    assert_eq!(h.store.get_status(&ticket).await.unwrap(), finished);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn ticket_processing_elsewhere_is_skipped_and_left_queued() {
    let dispatch = Arc::new(Scripted::default());
    let h = Harness::new(dispatch.clone()).await;
    let ticket = h.submit("ping", &[]).await;

    let status = h.store.get_status(&ticket).await.unwrap();
    let claimed = claim_transition(&status, "other_worker", Utc::now(), Duration::hours(1)).unwrap();
    h.store.set_status(&ticket, &claimed).await.unwrap();

    assert_eq!(h.next().await, Disposition::Skipped);
    assert_eq!(dispatch.calls(), 0);
    assert_eq!(h.queue.len(), 1, "message stays for redelivery");
}

#[tokio::test]
async fn orphaned_ticket_is_reclaimed() {
    let dispatch = Arc::new(Scripted::default());
    let h = Harness::new(dispatch.clone()).await;
    let ticket = h.submit("ping", &[]).await;

    let status = h.store.get_status(&ticket).await.unwrap();
    let long_ago = Utc::now() - Duration::hours(2);
    let claimed = claim_transition(&status, "dead_worker", long_ago, Duration::hours(1)).unwrap();
    h.store.set_status(&ticket, &claimed).await.unwrap();

    assert_eq!(h.next().await, Disposition::Finalized(StatusKind::Success));
    let status = h.store.get_status(&ticket).await.unwrap();
    assert_eq!(status.meta.tries, 2);
    assert_eq!(status.meta.workers[0], "dead_worker");
    assert_eq!(status.meta.workers[1], h.registration.name());
    assert!(status.meta.last_resume_time.is_some());
}

#[tokio::test]
async fn deferral_round_trip_reaches_a_terminal_state() {
    let dispatch = Arc::new(Scripted::new(vec![Ok(Outcome::defer().with_timeout(0))]));
    let h = Harness::new(dispatch.clone()).await;
    let ticket = h.submit("export", &[]).await;

    assert_eq!(h.next().await, Disposition::Deferred);
    let deferred = h.store.get_status(&ticket).await.unwrap();
    assert_eq!(deferred.status, StatusKind::Queued);
    assert!(deferred.meta.last_deferred_time.is_some());
    assert_eq!(h.queue.len(), 1);

    assert_eq!(h.next().await, Disposition::Finalized(StatusKind::Success));
    let done = h.store.get_status(&ticket).await.unwrap();
    assert_eq!(done.meta.tries, 2);
    assert!(done.meta.start_time.is_some());
    assert!(done.meta.last_resume_time.is_some());
    assert_eq!(h.result(&ticket).await, json!("ok"));
    assert!(h.queue.is_empty());
    assert_eq!(dispatch.calls(), 2);
}

#[tokio::test]
async fn deferral_without_timeout_waits_for_visibility() {
    let dispatch = Arc::new(Scripted::new(vec![Ok(Outcome::defer())]));
    let h = Harness::new(dispatch).await;
    h.submit("export", &[]).await;

    assert_eq!(h.next().await, Disposition::Deferred);
    assert_eq!(h.queue.len(), 1);
    assert_eq!(h.queue.visible_len(), 0);
}

#[tokio::test]
async fn resubmit_replaces_the_ticket() {
    let dispatch = Arc::new(Scripted::new(vec![Ok(Outcome::resubmit())]));
    let h = Harness::new(dispatch).await;
    let ticket = h.submit("export", &[("format", "csv")]).await;

    let Disposition::Resubmitted(replacement) = h.next().await else {
        panic!("expected a resubmission");
    };
    assert_ne!(replacement, ticket);

    let old = h.store.get_status(&ticket).await.unwrap();
    assert_eq!(old.status, StatusKind::Success);
    assert_eq!(old.meta.resubmitted_as.as_ref(), Some(&replacement));
    assert_eq!(h.result(&ticket).await, json!({ "resubmitted": replacement }));

    assert_eq!(h.queue.bodies(), vec![replacement.to_string()]);
    let new = h.store.get_status(&replacement).await.unwrap();
    assert_eq!(new.status, StatusKind::Queued);
    assert_eq!(
        h.store.get_request(&replacement).await.unwrap(),
        h.store.get_request(&ticket).await.unwrap()
    );
}

#[tokio::test]
async fn handler_error_is_captured_in_the_result() {
    let dispatch = Arc::new(Scripted::new(vec![Err("bad input".into())]));
    let h = Harness::new(dispatch).await;
    let ticket = h.submit("export", &[]).await;

    assert_eq!(h.next().await, Disposition::Finalized(StatusKind::Error));
    assert!(h.result(&ticket).await["error"].as_str().unwrap().contains("bad input"));
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn handler_panic_becomes_an_error() {
    let h = Harness::new(Arc::new(Scripted::default())).await;
    let ticket = h.submit("explode", &[]).await;

    assert_eq!(h.next().await, Disposition::Finalized(StatusKind::Error));
    let error = h.result(&ticket).await;
    assert!(error["error"].as_str().unwrap().contains("handler blew up"));
    assert!(!h.registration.is_busy());
}
