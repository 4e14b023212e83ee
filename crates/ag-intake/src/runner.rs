use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use ag_common::EventEnvelope;

use crate::consumer::{DeadLetterSink, EventConsumer, QueueMessage};
use crate::dispatch::{DispatchTable, HandleOutcome};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_messages_per_poll: u32,
    pub idle_backoff: Duration,
    pub error_backoff: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_messages_per_poll: 10,
            idle_backoff: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Poll loop binding a consumer to the dispatch table. Each polled message
/// is decoded, routed to its handler and settled against the queue
/// according to the handler's outcome.
pub struct IntakeRunner {
    consumer: Arc<dyn EventConsumer>,
    dispatch: Arc<DispatchTable>,
    dead_letters: Arc<dyn DeadLetterSink>,
    in_flight: DashMap<String, ()>,
    config: RunnerConfig,
}

impl IntakeRunner {
    pub fn new(
        consumer: Arc<dyn EventConsumer>,
        dispatch: Arc<DispatchTable>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            consumer,
            dispatch,
            dead_letters,
            in_flight: DashMap::new(),
            config,
        }
    }

    pub async fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            consumer = %self.consumer.identifier(),
            handled_types = ?self.dispatch.handled_types(),
            "Starting intake runner"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(consumer = %self.consumer.identifier(), "Intake runner shutting down");
                    break;
                }
                result = self.consumer.poll(self.config.max_messages_per_poll) => {
                    match result {
                        Ok(messages) if !messages.is_empty() => {
                            let mut handles = Vec::new();
                            for message in messages {
                                let runner = self.clone();
                                handles.push(tokio::spawn(async move {
                                    runner.process_message(message).await;
                                }));
                            }
                            for handle in handles {
                                let _ = handle.await;
                            }
                        }
                        Ok(_) => {
                            tokio::time::sleep(self.config.idle_backoff).await;
                        }
                        Err(e) => {
                            error!(consumer = %self.consumer.identifier(), "Error polling intake queue: {}", e);
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
            }
        }
    }

    /// Handles one delivery end to end. A delivery whose broker message id
    /// is already in flight is skipped with its receipt left unsettled; the
    /// broker redelivers it after the visibility timeout and that
    /// redelivery is processed on its own.
    pub async fn process_message(&self, message: QueueMessage) {
        if self.in_flight.insert(message.message_id.clone(), ()).is_some() {
            debug!(message_id = %message.message_id, "Delivery already in flight, skipping");
            return;
        }

        counter!("ag_intake_events_total").increment(1);
        let outcome = self.dispatch_message(&message).await;
        self.settle(&message, outcome).await;

        self.in_flight.remove(&message.message_id);
    }

    async fn dispatch_message(&self, message: &QueueMessage) -> HandleOutcome {
        let envelope: EventEnvelope = match serde_json::from_str(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                return HandleOutcome::Rejected {
                    reason: format!("malformed event envelope: {}", e),
                }
            }
        };

        match self.dispatch.resolve(&envelope.event_type) {
            Some(handler) => handler.handle(&envelope).await,
            None => HandleOutcome::Rejected {
                reason: format!(
                    "no handler registered for event type '{}'",
                    envelope.event_type
                ),
            },
        }
    }

    async fn settle(&self, message: &QueueMessage, outcome: HandleOutcome) {
        match outcome {
            HandleOutcome::Completed | HandleOutcome::Duplicate => {
                if let Err(e) = self.consumer.ack(&message.receipt_handle).await {
                    error!(message_id = %message.message_id, "Failed to ack message: {}", e);
                }
            }
            HandleOutcome::Rejected { reason } => {
                warn!(message_id = %message.message_id, reason = %reason, "Dead-lettering message");
                match self.dead_letters.send(message, &reason).await {
                    Ok(()) => {
                        counter!("ag_intake_dead_lettered_total").increment(1);
                        if let Err(e) = self.consumer.ack(&message.receipt_handle).await {
                            error!(message_id = %message.message_id, "Failed to ack dead-lettered message: {}", e);
                        }
                    }
                    Err(e) => {
                        // The delivery stays on the source queue until parking succeeds
                        error!(message_id = %message.message_id, "Failed to dead-letter message: {}", e);
                        if let Err(e) = self.consumer.nack(&message.receipt_handle, None).await {
                            error!(message_id = %message.message_id, "Failed to nack message: {}", e);
                        }
                    }
                }
            }
            HandleOutcome::Retry {
                error,
                delay_seconds,
            } => {
                counter!("ag_intake_retries_total").increment(1);
                warn!(message_id = %message.message_id, "Returning message for redelivery: {}", error);
                if let Err(e) = self.consumer.nack(&message.receipt_handle, delay_seconds).await {
                    error!(message_id = %message.message_id, "Failed to nack message: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::dispatch::EventHandler;
    use crate::error::{IntakeError, Result};

    struct RecordingConsumer {
        acked: Mutex<Vec<String>>,
        nacked: Mutex<Vec<(String, Option<u32>)>>,
    }

    impl RecordingConsumer {
        fn new() -> Self {
            Self {
                acked: Mutex::new(Vec::new()),
                nacked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EventConsumer for RecordingConsumer {
        fn identifier(&self) -> &str {
            "recording"
        }

        async fn poll(&self, _max_messages: u32) -> Result<Vec<QueueMessage>> {
            Ok(vec![])
        }

        async fn ack(&self, receipt_handle: &str) -> Result<()> {
            self.acked.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }

        async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
            self.nacked
                .lock()
                .unwrap()
                .push((receipt_handle.to_string(), delay_seconds));
            Ok(())
        }
    }

    struct RecordingSink {
        reasons: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                reasons: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn send(&self, _message: &QueueMessage, reason: &str) -> Result<()> {
            if self.fail {
                return Err(IntakeError::Queue("dead-letter queue unreachable".to_string()));
            }
            self.reasons.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    struct SlowHandler {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for SlowHandler {
        async fn handle(&self, _envelope: &EventEnvelope) -> HandleOutcome {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.invocations.fetch_add(1, Ordering::SeqCst);
            HandleOutcome::Completed
        }
    }

    fn envelope_body(event_type: &str) -> String {
        serde_json::json!({
            "id": "evt-1",
            "eventType": event_type,
            "payload": {}
        })
        .to_string()
    }

    fn message(id: &str, receipt: &str, body: String) -> QueueMessage {
        QueueMessage {
            message_id: id.to_string(),
            receipt_handle: receipt.to_string(),
            body,
        }
    }

    #[tokio::test]
    async fn test_same_message_id_processed_once_while_in_flight() {
        let handler = Arc::new(SlowHandler {
            invocations: AtomicUsize::new(0),
        });
        let mut table = DispatchTable::new();
        table.register("slow-event", handler.clone());

        let consumer = Arc::new(RecordingConsumer::new());
        let runner = Arc::new(IntakeRunner::new(
            consumer.clone(),
            Arc::new(table),
            Arc::new(RecordingSink::new(false)),
            RunnerConfig::default(),
        ));

        let body = envelope_body("slow-event");
        tokio::join!(
            runner.process_message(message("m-1", "rh-1", body.clone())),
            runner.process_message(message("m-1", "rh-2", body.clone())),
        );

        assert_eq!(handler.invocations.load(Ordering::SeqCst), 1);
        // Only the winning delivery settles; the skipped receipt is left
        // for the broker's visibility timeout
        assert_eq!(consumer.acked.lock().unwrap().len(), 1);
        assert!(consumer.nacked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unroutable_message_is_parked_and_acked() {
        let consumer = Arc::new(RecordingConsumer::new());
        let sink = Arc::new(RecordingSink::new(false));
        let runner = IntakeRunner::new(
            consumer.clone(),
            Arc::new(DispatchTable::new()),
            sink.clone(),
            RunnerConfig::default(),
        );

        runner
            .process_message(message("m-1", "rh-1", envelope_body("application-cancelled")))
            .await;

        let reasons = sink.reasons.lock().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("application-cancelled"));
        assert_eq!(consumer.acked.lock().unwrap().len(), 1);
        assert!(consumer.nacked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dead_letter_keeps_delivery_on_queue() {
        let consumer = Arc::new(RecordingConsumer::new());
        let runner = IntakeRunner::new(
            consumer.clone(),
            Arc::new(DispatchTable::new()),
            Arc::new(RecordingSink::new(true)),
            RunnerConfig::default(),
        );

        runner
            .process_message(message("m-1", "rh-1", "not json".to_string()))
            .await;

        assert!(consumer.acked.lock().unwrap().is_empty());
        assert_eq!(consumer.nacked.lock().unwrap().len(), 1);
    }
}
