//! Batch selection policy
//!
//! Pure rules for assigning a submission to a processing batch: which
//! batches qualify, how a fresh batch is shaped, and how its name is
//! generated. The backends apply these rules inside the intake transaction.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::model::BatchRecord;

pub const DEFAULT_MAX_APPLICATIONS: i32 = 10;
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

/// A batch row about to be inserted, already carrying its first assignment
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub id: Uuid,
    pub application_type_id: Uuid,
    pub provider: String,
    pub name: String,
    pub description: String,
    pub total_applications: i32,
    pub max_applications: i32,
    pub is_available: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Builds the batch created when no open batch has room. It opens a
/// 30-day window starting now and counts the triggering submission.
pub fn first_batch(application_type_id: Uuid, provider: &str, now: DateTime<Utc>) -> NewBatch {
    NewBatch {
        id: Uuid::new_v4(),
        application_type_id,
        provider: provider.to_string(),
        name: batch_name(provider, application_type_id, now),
        description: batch_description(provider),
        total_applications: 1,
        max_applications: DEFAULT_MAX_APPLICATIONS,
        is_available: true,
        start_date: now,
        end_date: now + Duration::days(DEFAULT_WINDOW_DAYS),
        created_at: now,
    }
}

/// `{provider}-BATCH-{first 8 chars of the application type id}-{yyyyMMdd-HHmmss}`.
/// Names are informational; the batch id is the only key, so same-second
/// collisions for one application type are tolerated.
pub fn batch_name(provider: &str, application_type_id: Uuid, now: DateTime<Utc>) -> String {
    let type_prefix: String = application_type_id.to_string().chars().take(8).collect();
    format!(
        "{}-BATCH-{}-{}",
        provider,
        type_prefix,
        now.format("%Y%m%d-%H%M%S")
    )
}

pub fn batch_description(provider: &str) -> String {
    format!("Auto-generated batch for {} applications", provider)
}

/// Candidate filter applied while scanning open batches. The conditional
/// claim re-checks this inside the database; the scan only avoids claim
/// round trips that cannot succeed.
pub fn has_capacity(batch: &BatchRecord) -> bool {
    batch.is_available && batch.total_applications < batch.max_applications
}
