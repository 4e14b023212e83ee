use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Event Types & Topics
// ============================================================================

/// Inbound event type announcing a newly submitted application
pub const EVENT_APPLICATION_SUBMITTED: &str = "application-submitted";

/// Outbound event type announcing that a case has been received
pub const EVENT_APPLICATION_RECEIVED: &str = "application-received";

/// Downstream topic/queue carrying lifecycle notifications
pub const TOPIC_APPLICATION_LIFECYCLE: &str = "application-lifecycle";

/// Wrapper around every message on the intake queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Inbound "application submitted" notification from the upstream service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSubmitted {
    pub submission_id: Uuid,
    pub application_type_id: Uuid,
    pub application_type_name: String,
    pub provider: String,
    // Wire form capitalizes the acronym, which rename_all would not produce.
    #[serde(default, rename = "objectKeysForAIAnalysis")]
    pub object_keys_for_ai_analysis: Option<Vec<String>>,
    #[serde(default)]
    pub document_ids: Option<Vec<Uuid>>,
    pub user_id: Uuid,
    pub full_name: String,
    pub submitted_at: DateTime<Utc>,
}

impl ApplicationSubmitted {
    /// True when the upstream attached at least one artifact for AI analysis
    pub fn has_ai_artifacts(&self) -> bool {
        self.object_keys_for_ai_analysis
            .as_ref()
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }
}

/// Outbound "application received" lifecycle notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationReceived {
    pub provider: String,
    pub user_id: Uuid,
    pub submission_id: Uuid,
    pub status: CaseStatus,
    pub received_at: DateTime<Utc>,
}

impl ApplicationReceived {
    pub fn pending(submission: &ApplicationSubmitted, received_at: DateTime<Utc>) -> Self {
        Self {
            provider: submission.provider.clone(),
            user_id: submission.user_id,
            submission_id: submission.submission_id,
            status: CaseStatus::Pending,
            received_at,
        }
    }
}

// ============================================================================
// Case Status
// ============================================================================

/// Workflow status of an insurance case. Intake only ever writes `Pending`;
/// the later values belong to downstream verification/inspection/policy/claim
/// services and are carried here so every service shares one vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Pending,
    Verified,
    ScheduleAssignedForInspection,
    InspectionCompleted,
    PolicyIssued,
    ClaimedIssued,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pending => "PENDING",
            CaseStatus::Verified => "VERIFIED",
            CaseStatus::ScheduleAssignedForInspection => "SCHEDULE_ASSIGNED_FOR_INSPECTION",
            CaseStatus::InspectionCompleted => "INSPECTION_COMPLETED",
            CaseStatus::PolicyIssued => "POLICY_ISSUED",
            CaseStatus::ClaimedIssued => "CLAIMED_ISSUED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(CaseStatus::Pending),
            "VERIFIED" => Some(CaseStatus::Verified),
            "SCHEDULE_ASSIGNED_FOR_INSPECTION" => Some(CaseStatus::ScheduleAssignedForInspection),
            "INSPECTION_COMPLETED" => Some(CaseStatus::InspectionCompleted),
            "POLICY_ISSUED" => Some(CaseStatus::PolicyIssued),
            "CLAIMED_ISSUED" => Some(CaseStatus::ClaimedIssued),
            _ => None,
        }
    }
}

// ============================================================================
// Outbox Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    PENDING,
    PROCESSING,
    COMPLETED,
    FAILED,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::PENDING => "PENDING",
            OutboxStatus::PROCESSING => "PROCESSING",
            OutboxStatus::COMPLETED => "COMPLETED",
            OutboxStatus::FAILED => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OutboxStatus::PENDING),
            "PROCESSING" => Some(OutboxStatus::PROCESSING),
            "COMPLETED" => Some(OutboxStatus::COMPLETED),
            "FAILED" => Some(OutboxStatus::FAILED),
            _ => None,
        }
    }
}

/// A lifecycle notification persisted alongside the case it announces.
/// Rows are written in the case-creation transaction and published later
/// by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event_type: String,
    pub topic: String,
    pub message_group: Option<String>,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_event_decodes_camel_case_payload() {
        let json = r#"{
            "submissionId": "7f1f69a2-0c1e-4b8e-9dd5-0a6f45e6a1b2",
            "applicationTypeId": "3d0c2b84-5a77-4f21-9c5e-8b2d9f0e4a11",
            "applicationTypeName": "Rice Crop Insurance",
            "provider": "PCIC",
            "objectKeysForAIAnalysis": ["uploads/field-1.jpg"],
            "documentIds": ["9b6a1f00-1111-4222-8333-444455556666"],
            "userId": "b2f7c1d0-9e8a-4b6c-8d5e-1f2a3b4c5d6e",
            "fullName": "Juan Dela Cruz",
            "submittedAt": "2025-06-01T08:30:00Z"
        }"#;

        let event: ApplicationSubmitted = serde_json::from_str(json).unwrap();
        assert_eq!(event.provider, "PCIC");
        assert_eq!(event.full_name, "Juan Dela Cruz");
        assert!(event.has_ai_artifacts());
        assert_eq!(event.document_ids.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn submitted_event_tolerates_missing_optional_lists() {
        let json = r#"{
            "submissionId": "7f1f69a2-0c1e-4b8e-9dd5-0a6f45e6a1b2",
            "applicationTypeId": "3d0c2b84-5a77-4f21-9c5e-8b2d9f0e4a11",
            "applicationTypeName": "Corn Crop Insurance",
            "provider": "PCIC",
            "userId": "b2f7c1d0-9e8a-4b6c-8d5e-1f2a3b4c5d6e",
            "fullName": "Maria Santos",
            "submittedAt": "2025-06-01T08:30:00Z"
        }"#;

        let event: ApplicationSubmitted = serde_json::from_str(json).unwrap();
        assert!(!event.has_ai_artifacts());
        assert!(event.document_ids.is_none());
    }

    #[test]
    fn received_event_serializes_pending_status() {
        let json = r#"{
            "submissionId": "7f1f69a2-0c1e-4b8e-9dd5-0a6f45e6a1b2",
            "applicationTypeId": "3d0c2b84-5a77-4f21-9c5e-8b2d9f0e4a11",
            "applicationTypeName": "Rice Crop Insurance",
            "provider": "PCIC",
            "userId": "b2f7c1d0-9e8a-4b6c-8d5e-1f2a3b4c5d6e",
            "fullName": "Juan Dela Cruz",
            "submittedAt": "2025-06-01T08:30:00Z"
        }"#;
        let submission: ApplicationSubmitted = serde_json::from_str(json).unwrap();

        let received = ApplicationReceived::pending(&submission, Utc::now());
        let value = serde_json::to_value(&received).unwrap();

        assert_eq!(value["provider"], "PCIC");
        assert_eq!(value["status"], "PENDING");
        assert_eq!(
            value["submissionId"],
            "7f1f69a2-0c1e-4b8e-9dd5-0a6f45e6a1b2"
        );
        assert!(value.get("receivedAt").is_some());
    }

    #[test]
    fn case_status_round_trips_through_storage_form() {
        for status in [
            CaseStatus::Pending,
            CaseStatus::Verified,
            CaseStatus::ScheduleAssignedForInspection,
            CaseStatus::InspectionCompleted,
            CaseStatus::PolicyIssued,
            CaseStatus::ClaimedIssued,
        ] {
            assert_eq!(CaseStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CaseStatus::parse("UNKNOWN"), None);
    }
}
