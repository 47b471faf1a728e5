use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;

use plenum_tickets::{claim_transition, JobRequest, MemoryTicketStore, StatusKind, TicketId, TicketStore};

#[tokio::test]
async fn exactly_one_racing_worker_claims_a_queued_ticket() {
    let store = Arc::new(MemoryTicketStore::default());
    let ticket = TicketId::generate();
    store.create(&ticket, &JobRequest::new("ping")).await.unwrap();

    let attempts = (0..8).map(|i| {
        let store = store.clone();
        let ticket = ticket.clone();
        tokio::spawn(async move {
            let current = store.get_status(&ticket).await.unwrap();
            let worker = format!("worker_{i}");
            match claim_transition(&current, &worker, Utc::now(), Duration::hours(1)) {
                Some(next) => store.swap_status(&ticket, current.version, &next).await.unwrap(),
                None => false,
            }
        })
    });

    let wins = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);

    let status = store.get_status(&ticket).await.unwrap();
    assert_eq!(status.status, StatusKind::Processing);
    assert_eq!(status.meta.workers.len(), 1);
    assert_eq!(status.meta.tries, 1);
}

#[tokio::test]
async fn swap_on_missing_ticket_is_not_found() {
    let store = MemoryTicketStore::default();
    let ticket = TicketId::generate();
    let next = claim_transition(
        &plenum_tickets::TicketStatus::queued(Utc::now()),
        "w",
        Utc::now(),
        Duration::hours(1),
    )
    .unwrap();
    let err = store.swap_status(&ticket, 0, &next).await.unwrap_err();
    assert!(err.is_poison());
}
