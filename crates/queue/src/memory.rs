//! In-process queue with SQS-like visibility semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{DurableQueue, QueueHealth, QueueMessage};

struct Entry {
    id: String,
    body: String,
    sent_at: DateTime<Utc>,
    visible_at: Instant,
    receive_count: u32,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    /// Receipts issued for messages still in the queue. A stale receipt
    /// still deletes its message, as SQS tolerates.
    receipts: HashMap<String, String>,
}

/// Memory-backed [`DurableQueue`] used by tests and `--memory` worker mode.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout_secs: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout: Duration::from_secs(u64::from(visibility_timeout_secs)),
        }
    }

    /// Messages still in the queue, visible or not.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn visible_len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.visible_at <= now)
            .count()
    }

    /// Bodies of all queued messages in send order.
    pub fn bodies(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }

    fn message_id_for(inner: &Inner, receipt_handle: &str) -> Result<String, QueueError> {
        inner
            .receipts
            .get(receipt_handle)
            .cloned()
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        self.inner.lock().unwrap().entries.push(Entry {
            id: id.clone(),
            body: body.to_string(),
            sent_at: Utc::now(),
            visible_at: Instant::now(),
            receive_count: 0,
        });
        Ok(id)
    }

    async fn poll(&self) -> Result<Option<QueueMessage>, QueueError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let Some(entry) = inner.entries.iter_mut().find(|e| e.visible_at <= now) else {
            return Ok(None);
        };
        entry.receive_count += 1;
        entry.visible_at = now + self.visibility_timeout;

        let message = QueueMessage {
            id: entry.id.clone(),
            body: entry.body.clone(),
            receipt_handle: format!("{}#{}", entry.id, entry.receive_count),
            timestamp: entry.sent_at,
            attempt_count: entry.receive_count,
        };
        inner
            .receipts
            .insert(message.receipt_handle.clone(), message.id.clone());
        Ok(Some(message))
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::message_id_for(&inner, receipt_handle)?;
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| QueueError::Visibility(format!("message {id} already deleted")))?;
        entry.visible_at = Instant::now() + Duration::from_secs(u64::from(seconds));
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::message_id_for(&inner, receipt_handle)?;
        inner.entries.retain(|e| e.id != id);
        inner.receipts.retain(|_, message| *message != id);
        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        Ok(QueueHealth {
            connected: true,
            approximate_message_count: Some(self.visible_len() as u64),
            provider: "memory".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn received_message_is_hidden_until_timeout() {
        let queue = MemoryQueue::new(300);
        queue.enqueue("ticket-a").await.unwrap();

        let msg = queue.poll().await.unwrap().unwrap();
        assert_eq!(msg.body, "ticket-a");
        assert_eq!(msg.attempt_count, 1);
        assert!(queue.poll().await.unwrap().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn undeleted_message_is_redelivered() {
        let queue = MemoryQueue::new(0);
        queue.enqueue("ticket-b").await.unwrap();

        let first = queue.poll().await.unwrap().unwrap();
        let second = queue.poll().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt_count, 2);
        assert_ne!(first.receipt_handle, second.receipt_handle);
    }

    #[tokio::test]
    async fn delete_removes_message_even_with_stale_receipt() {
        let queue = MemoryQueue::new(0);
        queue.enqueue("ticket-c").await.unwrap();

        let first = queue.poll().await.unwrap().unwrap();
        let _second = queue.poll().await.unwrap().unwrap();
        queue.delete(&first.receipt_handle).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extend_visibility_to_zero_releases_message() {
        let queue = MemoryQueue::new(300);
        queue.enqueue("ticket-d").await.unwrap();

        let msg = queue.poll().await.unwrap().unwrap();
        queue.extend_visibility(&msg.receipt_handle, 0).await.unwrap();
        assert_eq!(queue.visible_len(), 1);
        assert!(queue.poll().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_forgets_every_receipt_of_the_message() {
        let queue = MemoryQueue::new(300);
        queue.enqueue("ticket-e").await.unwrap();
        queue.enqueue("ticket-f").await.unwrap();

        let first = queue.poll().await.unwrap().unwrap();
        let other = queue.poll().await.unwrap().unwrap();
        assert_eq!(other.body, "ticket-f");
        queue.extend_visibility(&first.receipt_handle, 0).await.unwrap();
        let again = queue.poll().await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(queue.inner.lock().unwrap().receipts.len(), 3);

        queue.delete(&again.receipt_handle).await.unwrap();
        assert_eq!(queue.inner.lock().unwrap().receipts.len(), 1);
        assert!(matches!(
            queue.delete(&first.receipt_handle).await,
            Err(QueueError::UnknownReceipt(_))
        ));
    }

    #[tokio::test]
    async fn unknown_receipt_is_an_error() {
        let queue = MemoryQueue::new(30);
        let err = queue.delete("nope").await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownReceipt(_)));
    }

    #[tokio::test]
    async fn health_reports_visible_count() {
        let queue = MemoryQueue::new(300);
        queue.enqueue("a").await.unwrap();
        queue.enqueue("b").await.unwrap();
        queue.poll().await.unwrap();

        let health = queue.health_check().await.unwrap();
        assert_eq!(health.approximate_message_count, Some(1));
        assert_eq!(health.provider, "memory");
    }
}
