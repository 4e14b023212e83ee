use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tracing::{info, warn};

use ag_common::{ApplicationSubmitted, EventEnvelope};
use ag_store::{CaseStore, StoreError};

use crate::dispatch::{EventHandler, HandleOutcome};

/// Seconds a submission waits before redelivery after a transient failure
const RETRY_DELAY_SECONDS: u32 = 5;

/// Handler for `application-submitted` events. Decodes the payload and runs
/// the intake transaction: batch assignment, case row, the four empty
/// detail rows and the staged lifecycle notification, all or nothing.
pub struct IntakeService {
    store: Arc<dyn CaseStore>,
}

impl IntakeService {
    pub fn new(store: Arc<dyn CaseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for IntakeService {
    async fn handle(&self, envelope: &EventEnvelope) -> HandleOutcome {
        let submission: ApplicationSubmitted = match serde_json::from_value(envelope.payload.clone())
        {
            Ok(submission) => submission,
            Err(e) => {
                return HandleOutcome::Rejected {
                    reason: format!("malformed application-submitted payload: {}", e),
                }
            }
        };

        info!(
            submission_id = %submission.submission_id,
            provider = %submission.provider,
            application_type = %submission.application_type_name,
            "Processing submitted application"
        );

        match self.store.create_case(&submission).await {
            Ok(receipt) => {
                counter!("ag_intake_cases_created_total").increment(1);
                if receipt.batch_created {
                    counter!("ag_intake_batches_created_total").increment(1);
                }
                info!(
                    case_id = %receipt.case_id,
                    batch = %receipt.batch_name,
                    batch_created = receipt.batch_created,
                    "Created case"
                );
                HandleOutcome::Completed
            }
            Err(StoreError::DuplicateSubmission(submission_id)) => {
                counter!("ag_intake_duplicates_total").increment(1);
                info!(submission_id = %submission_id, "Submission already has a case, dropping redelivery");
                HandleOutcome::Duplicate
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    submission_id = %submission.submission_id,
                    "Transient intake failure, leaving for redelivery: {}", e
                );
                HandleOutcome::Retry {
                    error: e.to_string(),
                    delay_seconds: Some(RETRY_DELAY_SECONDS),
                }
            }
            Err(e) => HandleOutcome::Rejected {
                reason: e.to_string(),
            },
        }
    }
}
