use async_trait::async_trait;

use crate::error::Result;

/// A raw message pulled off the intake queue. `message_id` is the broker's
/// delivery-independent id and doubles as the in-flight dedup key;
/// `receipt_handle` belongs to this delivery only.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// Source of intake events. `ack` deletes a message for good, `nack`
/// returns it for redelivery after an optional delay.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Most recent poll outcome; feeds the worker's readiness endpoint
    fn is_healthy(&self) -> bool {
        true
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueueMessage>>;

    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;
}

/// Terminal parking spot for messages that can never be processed.
/// The original body travels unchanged so operators can replay it.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, message: &QueueMessage, reason: &str) -> Result<()>;
}
