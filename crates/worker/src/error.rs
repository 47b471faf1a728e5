use thiserror::Error;

use plenum_etl::EtlError;
use plenum_queue::QueueError;
use plenum_tickets::TicketError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("unknown endpoint: {0:?}")]
    UnknownEndpoint(String),

    #[error("invalid parameters for {endpoint}: {reason}")]
    InvalidParams { endpoint: String, reason: String },

    #[error("dataset {0} has not been ingested yet")]
    NotIngested(String),

    #[error("{0}")]
    Etl(#[from] EtlError),

    #[error("ticket store error: {0}")]
    Ticket(#[from] TicketError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("worker registry error: {0}")]
    Registry(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("no free worker name after {0} attempts")]
    NameExhausted(u32),

    #[error("handler panicked: {0}")]
    Panicked(String),
}
