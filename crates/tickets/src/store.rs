//! Ticket store trait and key layout.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;

use crate::error::TicketError;
use crate::types::{JobRequest, TicketId, TicketStatus};

/// Key layout shared by every backend:
/// `{prefix}:job:{status|request|result}:{ticket}` and `{prefix}:flag:{name}`.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn status(&self, ticket: &TicketId) -> String {
        format!("{}:job:status:{}", self.prefix, ticket)
    }

    pub fn request(&self, ticket: &TicketId) -> String {
        format!("{}:job:request:{}", self.prefix, ticket)
    }

    pub fn result(&self, ticket: &TicketId) -> String {
        format!("{}:job:result:{}", self.prefix, ticket)
    }

    pub fn flag(&self, name: &str) -> String {
        format!("{}:flag:{}", self.prefix, name)
    }
}

/// Persistence for ticket status, request and result records.
///
/// Each record is independently readable and writable. Every write refreshes
/// the retention TTL of all three records of that ticket; once it lapses the
/// ticket reads as [`TicketError::NotFound`].
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Write the request, an empty result, then a `queued` status.
    async fn create(&self, ticket: &TicketId, request: &JobRequest) -> Result<TicketStatus, TicketError> {
        let status = TicketStatus::queued(Utc::now());
        self.put_request(ticket, request).await?;
        self.set_result(ticket, &serde_json::Value::Null).await?;
        self.set_status(ticket, &status).await?;
        Ok(status)
    }

    async fn get_status(&self, ticket: &TicketId) -> Result<TicketStatus, TicketError>;

    async fn set_status(&self, ticket: &TicketId, status: &TicketStatus) -> Result<(), TicketError>;

    /// Replace the status only if the stored `version` equals `expected_version`.
    /// Returns `false` when another writer got there first.
    async fn swap_status(
        &self,
        ticket: &TicketId,
        expected_version: u64,
        next: &TicketStatus,
    ) -> Result<bool, TicketError>;

    async fn get_request(&self, ticket: &TicketId) -> Result<JobRequest, TicketError>;

    async fn put_request(&self, ticket: &TicketId, request: &JobRequest) -> Result<(), TicketError>;

    async fn get_result(&self, ticket: &TicketId) -> Result<serde_json::Value, TicketError>;

    async fn set_result(&self, ticket: &TicketId, result: &serde_json::Value) -> Result<(), TicketError>;

    /// Set a named flag unless it is already set. Returns whether this call set it.
    async fn try_set_flag(&self, name: &str, ttl_secs: u64) -> Result<bool, TicketError>;

    async fn clear_flag(&self, name: &str) -> Result<(), TicketError>;
}

pub(crate) fn decode<T: DeserializeOwned>(
    ticket: &TicketId,
    record: &'static str,
    raw: &str,
) -> Result<T, TicketError> {
    serde_json::from_str(raw).map_err(|e| TicketError::Corrupt {
        ticket: ticket.clone(),
        record,
        reason: e.to_string(),
    })
}
