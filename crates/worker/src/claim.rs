//! One pass of the claim loop: a received message in, a settled ticket out.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use plenum_core::config::WorkerConfig;
use plenum_queue::{DurableQueue, QueueMessage};
use plenum_tickets::lifecycle::{defer_transition, finish_transition, resubmit_transition};
use plenum_tickets::{
    claim_transition, JobClient, JobRequest, StatusKind, TicketError, TicketId, TicketStatus, TicketStore,
};

use crate::dispatch::Dispatch;
use crate::error::WorkerError;
use crate::outcome::{Action, Outcome};
use crate::registry::Registration;

/// How a message was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Poison or duplicate of a finished ticket: message deleted, store untouched.
    Discarded,
    /// Not claimable right now: message left for redelivery.
    Skipped,
    Finalized(StatusKind),
    Deferred,
    Resubmitted(TicketId),
}

pub struct Claimer {
    store: Arc<dyn TicketStore>,
    queue: Arc<dyn DurableQueue>,
    dispatch: Arc<dyn Dispatch>,
    jobs: JobClient,
    job_timeout: chrono::Duration,
    keepalive_secs: Option<u32>,
}

impl Claimer {
    pub fn new(
        store: Arc<dyn TicketStore>,
        queue: Arc<dyn DurableQueue>,
        dispatch: Arc<dyn Dispatch>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            jobs: JobClient::new(store.clone(), queue.clone()),
            store,
            queue,
            dispatch,
            job_timeout: chrono::Duration::seconds(config.job_timeout_secs as i64),
            keepalive_secs: None,
        }
    }

    /// Keep the message invisible while a handler runs by re-extending its
    /// visibility to `visibility_secs` at half that interval.
    pub fn with_keepalive(mut self, visibility_secs: u32) -> Self {
        self.keepalive_secs = Some(visibility_secs).filter(|s| *s > 0);
        self
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.queue
    }

    pub async fn process_message(
        &self,
        registration: &Registration,
        message: &QueueMessage,
    ) -> Result<Disposition, WorkerError> {
        let ticket: TicketId = match message.body.trim().parse() {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(message = %message.id, error = %e, "Discarding message without a valid ticket id");
                return self.discard(message).await;
            }
        };

        let status = match self.store.get_status(&ticket).await {
            Ok(status) => status,
            Err(e) if e.is_poison() => {
                warn!(ticket = %ticket, error = %e, "Discarding poison ticket");
                return self.discard(message).await;
            }
            Err(e) => return Err(e.into()),
        };
        let request = match self.store.get_request(&ticket).await {
            Ok(request) => request,
            Err(e) if e.is_poison() => {
                warn!(ticket = %ticket, error = %e, "Discarding ticket without a readable request");
                return self.discard(message).await;
            }
            Err(e) => return Err(e.into()),
        };

        if status.status.is_terminal() {
            debug!(ticket = %ticket, status = %status.status, "Redelivered finished ticket");
            return self.discard(message).await;
        }

        let worker = registration.name();
        let Some(claimed) = claim_transition(&status, worker, Utc::now(), self.job_timeout) else {
            debug!(ticket = %ticket, status = %status.status, "Ticket busy elsewhere, leaving message");
            return Ok(Disposition::Skipped);
        };
        match self.store.swap_status(&ticket, status.version, &claimed).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(ticket = %ticket, worker, "Lost claim race");
                return Ok(Disposition::Skipped);
            }
            Err(e) if e.is_poison() => {
                warn!(ticket = %ticket, error = %e, "Ticket vanished while claiming");
                return self.discard(message).await;
            }
            Err(e) => return Err(e.into()),
        }

        if status.status == StatusKind::Processing {
            warn!(ticket = %ticket, worker, previous = ?status.meta.workers, "Reclaimed orphaned ticket");
        }
        info!(
            ticket = %ticket,
            worker,
            endpoint = %request.endpoint,
            tries = claimed.meta.tries,
            "Ticket claimed"
        );

        registration.claim(&ticket).await;
        let result = self.run(&request, message).await;
        let disposition = self.settle(&ticket, &request, &claimed, message, result).await;
        registration.release_claim().await;
        disposition
    }

    /// Run the handler in its own task so a panic becomes an operation fault.
    async fn run(&self, request: &JobRequest, message: &QueueMessage) -> Result<Outcome, WorkerError> {
        let dispatch = self.dispatch.clone();
        let owned = request.clone();
        let mut handle = tokio::spawn(async move { dispatch.dispatch(&owned).await });

        let joined = match self.keepalive_secs {
            None => (&mut handle).await,
            Some(secs) => {
                let mut ticker = tokio::time::interval(Duration::from_secs(u64::from((secs / 2).max(1))));
                ticker.tick().await;
                loop {
                    tokio::select! {
                        joined = &mut handle => break joined,
                        _ = ticker.tick() => {
                            if let Err(e) = self.queue.extend_visibility(&message.receipt_handle, secs).await {
                                warn!(message = %message.id, error = %e, "Failed to extend visibility");
                            }
                        }
                    }
                }
            }
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(WorkerError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(WorkerError::Panicked(e.to_string())),
        }
    }

    async fn settle(
        &self,
        ticket: &TicketId,
        request: &JobRequest,
        claimed: &TicketStatus,
        message: &QueueMessage,
        result: Result<Outcome, WorkerError>,
    ) -> Result<Disposition, WorkerError> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(ticket = %ticket, endpoint = %request.endpoint, error = %e, "Job failed");
                let payload = json!({ "error": e.to_string() });
                return self.complete(ticket, claimed, message, StatusKind::Error, payload).await;
            }
        };

        if let Some(secs) = outcome.extend_visibility {
            if let Err(e) = self.queue.extend_visibility(&message.receipt_handle, secs).await {
                warn!(ticket = %ticket, error = %e, "Failed to extend visibility");
            }
        }

        match outcome.action {
            Action::Done(payload) => self.complete(ticket, claimed, message, StatusKind::Success, payload).await,
            Action::Defer => {
                let deferred = defer_transition(claimed, Utc::now());
                if !self.store.swap_status(ticket, claimed.version, &deferred).await? {
                    warn!(ticket = %ticket, "Ticket changed hands during execution, not deferring");
                    return Ok(Disposition::Skipped);
                }
                info!(ticket = %ticket, retry_in = ?outcome.extend_visibility, "Ticket deferred");
                Ok(Disposition::Deferred)
            }
            Action::Resubmit => {
                let replacement = self.jobs.submit_request(request).await?;
                self.store
                    .set_result(ticket, &json!({ "resubmitted": replacement }))
                    .await?;
                let finished = resubmit_transition(claimed, &replacement, Utc::now());
                if !self.store.swap_status(ticket, claimed.version, &finished).await? {
                    warn!(ticket = %ticket, "Ticket changed hands during execution");
                    return Ok(Disposition::Resubmitted(replacement));
                }
                self.delete(message).await;
                info!(ticket = %ticket, replacement = %replacement, "Ticket resubmitted");
                Ok(Disposition::Resubmitted(replacement))
            }
        }
    }

    /// Result first, then status, so a poller never sees a terminal status
    /// without its payload.
    async fn complete(
        &self,
        ticket: &TicketId,
        claimed: &TicketStatus,
        message: &QueueMessage,
        outcome: StatusKind,
        payload: Value,
    ) -> Result<Disposition, WorkerError> {
        self.store.set_result(ticket, &payload).await?;
        let finished = finish_transition(claimed, outcome, Utc::now());
        match self.store.swap_status(ticket, claimed.version, &finished).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(ticket = %ticket, "Ticket changed hands during execution, leaving it to its new owner");
                return Ok(Disposition::Skipped);
            }
            Err(TicketError::NotFound(_)) => {
                warn!(ticket = %ticket, "Ticket expired during execution");
                self.delete(message).await;
                return Ok(Disposition::Discarded);
            }
            Err(e) => return Err(e.into()),
        }
        self.delete(message).await;
        info!(ticket = %ticket, status = %outcome, "Ticket finalized");
        Ok(Disposition::Finalized(outcome))
    }

    async fn discard(&self, message: &QueueMessage) -> Result<Disposition, WorkerError> {
        self.queue.delete(&message.receipt_handle).await?;
        Ok(Disposition::Discarded)
    }

    /// A failed delete only means a redelivery, which the status gate absorbs.
    async fn delete(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(&message.receipt_handle).await {
            warn!(message = %message.id, error = %e, "Failed to delete settled message");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
