use ag_common::CaseStatus;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A capacity- and time-bounded grouping of cases for one application type
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub id: Uuid,
    pub application_type_id: Uuid,
    pub provider: String,
    pub name: String,
    pub description: Option<String>,
    pub total_applications: i32,
    pub max_applications: i32,
    pub is_available: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One insurance case per submitted application
#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub application_type_id: Uuid,
    pub application_type_name: String,
    pub provider: String,
    pub farmer_id: Uuid,
    pub farmer_name: String,
    pub current_status: CaseStatus,
    pub is_ai_processed: bool,
    pub batch_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// The four detail records are created empty with the case and filled in by
// downstream services, so every domain column is optional.

#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub verifier_id: Option<Uuid>,
    pub verifier_name: Option<String>,
    pub remarks: Option<String>,
    pub verification_documents: Option<serde_json::Value>,
    pub field_values: Option<serde_json::Value>,
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct InspectionRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub inspector_id: Option<Uuid>,
    pub inspector_name: Option<String>,
    pub inspected_at: Option<DateTime<Utc>>,
    pub photos: Option<serde_json::Value>,
    pub field_values: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PolicyRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub policy_number: Option<String>,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ClaimRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub filed_at: Option<DateTime<Utc>>,
    pub damage_assessment: Option<String>,
    pub claim_amount: Option<f64>,
    pub supporting_files: Option<serde_json::Value>,
    pub field_values: Option<serde_json::Value>,
}

/// The case with its four detail records, assembled by query.
/// Details reference the case by foreign key only; there is no
/// object graph back from the case to its details.
#[derive(Debug, Clone)]
pub struct CaseAggregate {
    pub case: CaseRecord,
    pub verification: VerificationRecord,
    pub inspection: InspectionRecord,
    pub policy: PolicyRecord,
    pub claim: ClaimRecord,
}

/// Outcome of one committed intake transaction
#[derive(Debug, Clone)]
pub struct IntakeReceipt {
    pub case_id: Uuid,
    pub batch_id: Uuid,
    pub batch_name: String,
    pub batch_created: bool,
    pub received_at: DateTime<Utc>,
}

/// Resolution of the batch-selection step inside the intake transaction
#[derive(Debug, Clone)]
pub struct BatchAssignment {
    pub batch_id: Uuid,
    pub batch_name: String,
    pub created: bool,
}
