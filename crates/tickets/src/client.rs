//! Submitting jobs and reading them back.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use plenum_queue::DurableQueue;

use crate::error::TicketError;
use crate::lifecycle::finish_transition;
use crate::store::TicketStore;
use crate::types::{JobRequest, JobView, StatusKind, TicketId, TicketStatus};

/// Submitter-side handle: creates tickets and hands their IDs to the queue.
#[derive(Clone)]
pub struct JobClient {
    store: Arc<dyn TicketStore>,
    queue: Arc<dyn DurableQueue>,
}

impl JobClient {
    pub fn new(store: Arc<dyn TicketStore>, queue: Arc<dyn DurableQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn submit(
        &self,
        endpoint: &str,
        query: BTreeMap<String, String>,
    ) -> Result<TicketId, TicketError> {
        self.submit_request(&JobRequest {
            endpoint: endpoint.to_string(),
            query,
        })
        .await
    }

    /// The ticket is fully written before its ID reaches the queue, so a
    /// worker can never receive an ID whose records do not exist yet.
    pub async fn submit_request(&self, request: &JobRequest) -> Result<TicketId, TicketError> {
        let ticket = TicketId::generate();
        let status = self.store.create(&ticket, request).await?;

        if let Err(e) = self.queue.enqueue(ticket.as_str()).await {
            warn!(ticket = %ticket, error = %e, "Enqueue failed, marking ticket as error");
            let failed = finish_transition(&status, StatusKind::Error, Utc::now());
            self.store
                .set_result(&ticket, &json!({ "error": format!("could not enqueue job: {e}") }))
                .await?;
            self.store.set_status(&ticket, &failed).await?;
            return Err(e.into());
        }

        info!(ticket = %ticket, endpoint = %request.endpoint, "Job submitted");
        Ok(ticket)
    }

    /// Status of a ticket, or `None` for an unknown or expired one.
    pub async fn status(&self, ticket: &TicketId) -> Result<Option<TicketStatus>, TicketError> {
        match self.store.get_status(ticket).await {
            Ok(status) => Ok(Some(status)),
            Err(TicketError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn job(&self, ticket: &TicketId) -> Result<Option<JobView>, TicketError> {
        let Some(status) = self.status(ticket).await? else {
            return Ok(None);
        };
        let request = self.store.get_request(ticket).await?;
        let result = match self.store.get_result(ticket).await {
            Ok(value) => value,
            Err(TicketError::NotFound(_)) => serde_json::Value::Null,
            Err(e) => return Err(e),
        };
        Ok(Some(JobView {
            ticket: ticket.clone(),
            status,
            request,
            result,
        }))
    }
}
