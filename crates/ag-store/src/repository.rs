use std::time::Duration;

use ag_common::{ApplicationSubmitted, OutboxRecord, OutboxStatus};
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{BatchRecord, CaseAggregate, CaseRecord, IntakeReceipt};

/// Durable storage for batches, cases and their detail records.
///
/// `create_case` is the whole intake unit of work: batch assignment, the
/// case row, its four empty details and the lifecycle outbox row commit or
/// roll back together.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn create_case(&self, submission: &ApplicationSubmitted) -> Result<IntakeReceipt>;

    async fn find_case_by_submission(&self, submission_id: Uuid) -> Result<Option<CaseRecord>>;

    /// Assembles the case with its four details by query
    async fn load_case(&self, case_id: Uuid) -> Result<Option<CaseAggregate>>;

    /// Batches for one application type, oldest first
    async fn list_batches(&self, application_type_id: Uuid) -> Result<Vec<BatchRecord>>;
}

/// Relay-side view of the outbox table
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest pending rows, up to `limit`
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxRecord>>;

    async fn mark_processing(&self, ids: Vec<Uuid>) -> Result<()>;

    /// Marking a row FAILED also increments its retry count
    async fn update_status(
        &self,
        id: Uuid,
        status: OutboxStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// Returns FAILED rows below the retry cap to PENDING
    async fn requeue_failed(&self, max_retries: u32) -> Result<u64>;

    /// Returns PROCESSING rows older than `timeout` to PENDING
    async fn recover_stuck(&self, timeout: Duration) -> Result<u64>;
}
