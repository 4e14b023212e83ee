//! SQS-backed consumer and dead-letter sink.
//!
//! Long-polls the intake queue with a 10 second wait. `nack` adjusts the
//! message visibility instead of re-sending, so redelivery keeps the
//! broker's original message id and the duplicate handling upstream of us
//! keeps working.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use aws_sdk_sqs::types::MessageAttributeValue;
use tracing::{debug, warn};

use crate::consumer::{DeadLetterSink, EventConsumer, QueueMessage};
use crate::error::{IntakeError, Result};

const WAIT_TIME_SECONDS: i32 = 10;

/// SQS allows at most this many messages per receive call
const MAX_RECEIVE_BATCH: u32 = 10;

pub struct SqsEventConsumer {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    identifier: String,
    /// Outcome of the most recent poll; false until the first one succeeds
    poll_ok: AtomicBool,
}

impl SqsEventConsumer {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        let identifier = queue_name(&queue_url);
        Self {
            client,
            queue_url,
            identifier,
            poll_ok: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventConsumer for SqsEventConsumer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn is_healthy(&self) -> bool {
        self.poll_ok.load(Ordering::Relaxed)
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueueMessage>> {
        let response = match self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(MAX_RECEIVE_BATCH) as i32)
            .wait_time_seconds(WAIT_TIME_SECONDS)
            .send()
            .await
        {
            Ok(response) => {
                self.poll_ok.store(true, Ordering::Relaxed);
                response
            }
            Err(e) => {
                self.poll_ok.store(false, Ordering::Relaxed);
                return Err(IntakeError::Queue(e.to_string()));
            }
        };

        let mut polled = Vec::new();
        for message in response.messages() {
            let (Some(message_id), Some(receipt_handle), Some(body)) = (
                message.message_id(),
                message.receipt_handle(),
                message.body(),
            ) else {
                warn!(queue = %self.identifier, "Dropping SQS message without id, handle or body");
                continue;
            };

            polled.push(QueueMessage {
                message_id: message_id.to_string(),
                receipt_handle: receipt_handle.to_string(),
                body: body.to_string(),
            });
        }

        if !polled.is_empty() {
            debug!(queue = %self.identifier, count = polled.len(), "Polled intake messages");
        }
        Ok(polled)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| IntakeError::Queue(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.unwrap_or(0) as i32)
            .send()
            .await
            .map_err(|e| IntakeError::Queue(e.to_string()))?;
        Ok(())
    }
}

/// Forwards the original message body to a parking queue, with the
/// rejection reason attached as a message attribute.
pub struct SqsDeadLetterSink {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    fifo: bool,
}

impl SqsDeadLetterSink {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        let fifo = queue_url.ends_with(".fifo");
        Self {
            client,
            queue_url,
            fifo,
        }
    }
}

#[async_trait]
impl DeadLetterSink for SqsDeadLetterSink {
    async fn send(&self, message: &QueueMessage, reason: &str) -> Result<()> {
        let reason_attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(reason)
            .build()
            .map_err(|e| IntakeError::Queue(e.to_string()))?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .message_attributes("deadLetterReason", reason_attribute);

        if self.fifo {
            request = request
                .message_group_id("dead-letter")
                .message_deduplication_id(&message.message_id);
        }

        request
            .send()
            .await
            .map_err(|e| IntakeError::Queue(e.to_string()))?;

        debug!(message_id = %message.message_id, "Parked message on dead-letter queue");
        Ok(())
    }
}

fn queue_name(queue_url: &str) -> String {
    queue_url
        .rsplit('/')
        .next()
        .unwrap_or(queue_url)
        .to_string()
}
