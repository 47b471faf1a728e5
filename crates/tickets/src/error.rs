use thiserror::Error;

use plenum_queue::QueueError;

use crate::types::TicketId;

#[derive(Error, Debug)]
pub enum TicketError {
    #[error("ticket not found: {0}")]
    NotFound(TicketId),

    #[error("malformed ticket id: {0:?}")]
    MalformedId(String),

    #[error("ticket {ticket} has a corrupt {record} record: {reason}")]
    Corrupt {
        ticket: TicketId,
        record: &'static str,
        reason: String,
    },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl TicketError {
    /// A ticket that can never be processed: missing, expired, or unreadable.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            TicketError::NotFound(_) | TicketError::MalformedId(_) | TicketError::Corrupt { .. }
        )
    }
}
