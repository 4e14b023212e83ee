//! Outbox relay
//!
//! Publishes lifecycle notifications staged by the intake transaction.
//! A poll loop fetches pending outbox rows, marks them processing, hands
//! each to the configured publisher and records the outcome per row. A
//! slower maintenance pass returns stuck rows to pending and requeues
//! failed rows that still have retries left, so a crashed relay or a
//! flaky queue never loses a notification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use ag_common::{OutboxRecord, OutboxStatus};
use ag_store::OutboxStore;

/// Destination for relayed notifications. Implementations return the
/// provider-side message id.
#[async_trait]
pub trait LifecyclePublisher: Send + Sync {
    async fn publish(&self, record: &OutboxRecord) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    /// Failed rows are requeued until their retry count reaches this ceiling
    pub max_retries: u32,
    /// Age after which a PROCESSING row is considered abandoned
    pub stuck_timeout: Duration,
    pub maintenance_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 50,
            max_retries: 5,
            stuck_timeout: Duration::from_secs(300),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn LifecyclePublisher>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn LifecyclePublisher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub async fn start(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox relay"
        );

        let mut last_maintenance = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Outbox relay shutting down");
                    break;
                }
                _ = sleep(self.config.poll_interval) => {
                    if let Err(e) = self.process_batch().await {
                        error!("Error processing outbox batch: {}", e);
                    }
                    if last_maintenance.elapsed() >= self.config.maintenance_interval {
                        self.run_maintenance().await;
                        last_maintenance = Instant::now();
                    }
                }
            }
        }
    }

    /// One poll: fetch pending rows, claim them, publish each and record
    /// the per-row outcome. Returns the number published.
    pub async fn process_batch(&self) -> Result<usize> {
        let records = self.store.fetch_pending(self.config.batch_size).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        self.store.mark_processing(ids).await?;

        let mut published = 0;
        for record in records {
            debug!(outbox_id = %record.id, event_type = %record.event_type, "Publishing outbox row");

            match self.publisher.publish(&record).await {
                Ok(message_id) => {
                    self.store
                        .update_status(record.id, OutboxStatus::COMPLETED, None)
                        .await?;
                    counter!("ag_outbox_published_total").increment(1);
                    debug!(outbox_id = %record.id, message_id = %message_id, "Published notification");
                    published += 1;
                }
                Err(e) => {
                    error!(outbox_id = %record.id, "Failed to publish outbox row: {}", e);
                    self.store
                        .update_status(record.id, OutboxStatus::FAILED, Some(e.to_string()))
                        .await?;
                    counter!("ag_outbox_failed_total").increment(1);
                }
            }
        }

        Ok(published)
    }

    /// Recovers rows abandoned mid-flight and requeues retryable failures
    pub async fn run_maintenance(&self) {
        match self.store.recover_stuck(self.config.stuck_timeout).await {
            Ok(recovered) if recovered > 0 => {
                counter!("ag_outbox_recovered_total").increment(recovered);
            }
            Ok(_) => {}
            Err(e) => error!("Error recovering stuck outbox rows: {}", e),
        }

        match self.store.requeue_failed(self.config.max_retries).await {
            Ok(requeued) if requeued > 0 => {
                counter!("ag_outbox_requeued_total").increment(requeued);
            }
            Ok(_) => {}
            Err(e) => error!("Error requeuing failed outbox rows: {}", e),
        }
    }
}
