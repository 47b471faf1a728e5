//! Durable queue trait and types.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// A message received from the jobs queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Unique message identifier from the queue provider.
    pub id: String,
    /// Raw message body. For the jobs queue this is a ticket ID.
    pub body: String,
    /// Provider-specific handle used for visibility changes and deletes.
    pub receipt_handle: String,
    /// When the message was sent to the queue.
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been received.
    pub attempt_count: u32,
}

/// Health status of a queue connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Approximate number of visible messages waiting in the queue.
    pub approximate_message_count: Option<u64>,
    /// Queue provider name ("sqs", "memory").
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, messages: {:?}, provider: {} }}",
            self.connected, self.approximate_message_count, self.provider
        )
    }
}

/// At-least-once message channel with per-message visibility timeouts.
///
/// A received message stays invisible to other consumers until its
/// visibility window lapses; unless it is deleted first, it then becomes
/// receivable again. There is no ordering guarantee between messages.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Send a message and return the provider's message ID.
    async fn enqueue(&self, body: &str) -> Result<String, QueueError>;

    /// Receive at most one message. Returns `None` when nothing is visible.
    async fn poll(&self) -> Result<Option<QueueMessage>, QueueError>;

    /// Reset the visibility window of a held message to `seconds` from now.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<(), QueueError>;

    /// Acknowledge a message, removing it from the queue for good.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}
