//! AWS SQS queue implementation.

use async_trait::async_trait;
use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_credential_types::Credentials;
use aws_sdk_sqs::config::BehaviorVersion;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use plenum_core::config::{AwsConfig, QueueConfig};

use crate::error::QueueError;
use crate::queue::{DurableQueue, QueueHealth, QueueMessage};

/// SQS-backed jobs queue.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    visibility_timeout_secs: i32,
    wait_time_secs: i32,
}

impl SqsQueue {
    pub async fn new(aws: &AwsConfig, queue: &QueueConfig) -> Result<Self, QueueError> {
        if queue.queue_url.is_empty() {
            return Err(QueueError::Connection("queue URL is not configured".into()));
        }

        let region = aws_sdk_sqs::config::Region::new(aws.region.clone());

        // Build the SQS config directly rather than through aws_config::defaults(),
        // which would honour a generic AWS_ENDPOINT_URL meant for another service.
        let mut sqs_config = aws_sdk_sqs::Config::builder()
            .region(region.clone())
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&aws.access_key_id, &aws.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                aws.session_token.clone(),
                None,
                "plenum-queue-static",
            );
            sqs_config = sqs_config.credentials_provider(creds);
        } else {
            let chain = DefaultCredentialsChain::builder().region(region).build().await;
            sqs_config = sqs_config.credentials_provider(chain);
        }

        if let Some(ref endpoint) = aws.endpoint_url {
            let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{endpoint}")
            };
            sqs_config = sqs_config.endpoint_url(&url);
        }

        let client = Client::from_conf(sqs_config.build());

        info!(
            queue_url = %queue.queue_url,
            region = %aws.region,
            "SQS queue initialized"
        );

        Ok(Self {
            client,
            queue_url: queue.queue_url.clone(),
            visibility_timeout_secs: queue.visibility_timeout_secs as i32,
            wait_time_secs: queue.wait_time_secs as i32,
        })
    }
}

#[async_trait]
impl DurableQueue for SqsQueue {
    async fn enqueue(&self, body: &str) -> Result<String, QueueError> {
        let resp = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Send(format!("SQS send failed: {e:?}")))?;

        let id = resp.message_id().unwrap_or("unknown").to_string();
        debug!(message_id = %id, "Enqueued SQS message");
        Ok(id)
    }

    async fn poll(&self) -> Result<Option<QueueMessage>, QueueError> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(self.wait_time_secs)
            .visibility_timeout(self.visibility_timeout_secs)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS receive failed: {e:?}")))?;

        let Some(msg) = resp.messages.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };

        let id = msg.message_id().unwrap_or("unknown").to_string();
        let body = msg.body().unwrap_or("").to_string();
        let receipt_handle = msg
            .receipt_handle()
            .ok_or_else(|| QueueError::Parse("missing receipt handle".into()))?
            .to_string();

        // SentTimestamp is epoch millis.
        let timestamp = msg
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::SentTimestamp))
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let attempt_count = msg
            .attributes()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(1);

        debug!(message_id = %id, attempt_count, "Received SQS message");

        Ok(Some(QueueMessage {
            id,
            body,
            receipt_handle,
            timestamp,
            attempt_count,
        }))
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<(), QueueError> {
        debug!(seconds, "Changing SQS message visibility");

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds.min(43_200) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Visibility(format!("SQS visibility change failed: {e:?}")))?;

        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete(format!("SQS delete failed: {e:?}")))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| QueueError::Connection(format!("SQS health check failed: {e:?}")))?;

        let count = resp
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok());

        Ok(QueueHealth {
            connected: true,
            approximate_message_count: count,
            provider: "sqs".to_string(),
        })
    }
}
