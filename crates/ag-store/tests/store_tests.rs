//! Case Store Tests
//!
//! Tests for:
//! - Batch creation, reuse, window expiry and rollover at capacity
//! - Case creation with empty detail records
//! - Duplicate submission handling
//! - Transaction atomicity under failure
//! - Capacity invariants under concurrent intake
//! - Outbox row lifecycle (fetch, mark, complete, fail, requeue, recover)

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use ag_common::{
    ApplicationSubmitted, CaseStatus, OutboxStatus, EVENT_APPLICATION_RECEIVED,
    TOPIC_APPLICATION_LIFECYCLE,
};
use ag_store::sqlite::SqliteCaseStore;
use ag_store::{CaseStore, OutboxStore, StoreError};

/// In-memory sqlite keeps one database per connection, so the pool is
/// pinned to a single connection for the whole test.
async fn memory_store() -> (SqliteCaseStore, SqlitePool) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let store = SqliteCaseStore::new(pool.clone());
    store.init_schema().await.unwrap();
    (store, pool)
}

fn submission_for(application_type_id: Uuid) -> ApplicationSubmitted {
    ApplicationSubmitted {
        submission_id: Uuid::new_v4(),
        application_type_id,
        application_type_name: "Rice Crop Insurance".to_string(),
        provider: "PCIC".to_string(),
        object_keys_for_ai_analysis: None,
        document_ids: None,
        user_id: Uuid::new_v4(),
        full_name: "Juan Dela Cruz".to_string(),
        submitted_at: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
    }
}

async fn table_count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

// ============================================================================
// Batch Selection
// ============================================================================

#[tokio::test]
async fn test_first_submission_creates_batch_and_pending_case() {
    let (store, _pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();
    let submission = submission_for(application_type_id);

    let receipt = store.create_case(&submission).await.unwrap();

    assert!(receipt.batch_created);
    assert!(receipt.batch_name.starts_with("PCIC-BATCH-"));
    let type_prefix: String = application_type_id.to_string().chars().take(8).collect();
    assert!(receipt.batch_name.contains(&type_prefix));

    let batches = store.list_batches(application_type_id).await.unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.id, receipt.batch_id);
    assert_eq!(batch.total_applications, 1);
    assert_eq!(batch.max_applications, 10);
    assert!(batch.is_available);
    assert_eq!(batch.end_date - batch.start_date, chrono::Duration::days(30));
    assert_eq!(
        batch.description.as_deref(),
        Some("Auto-generated batch for PCIC applications")
    );

    let case = store
        .find_case_by_submission(submission.submission_id)
        .await
        .unwrap()
        .expect("case should exist");
    assert_eq!(case.id, receipt.case_id);
    assert_eq!(case.current_status, CaseStatus::Pending);
    assert_eq!(case.batch_id, receipt.batch_id);
    assert!(!case.is_ai_processed);
    assert_eq!(case.farmer_id, submission.user_id);
    assert_eq!(case.farmer_name, "Juan Dela Cruz");
    assert_eq!(case.submitted_at, submission.submitted_at);
}

#[tokio::test]
async fn test_open_batch_reused_until_capacity() {
    let (store, _pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();

    let first = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();

    for _ in 0..8 {
        let receipt = store
            .create_case(&submission_for(application_type_id))
            .await
            .unwrap();
        assert!(!receipt.batch_created);
        assert_eq!(receipt.batch_id, first.batch_id);
    }

    let batches = store.list_batches(application_type_id).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].total_applications, 9);
}

#[tokio::test]
async fn test_full_batch_rolls_over_to_a_new_one() {
    let (store, _pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();

    let first = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();
    for _ in 0..9 {
        store
            .create_case(&submission_for(application_type_id))
            .await
            .unwrap();
    }

    let eleventh = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();
    assert!(eleventh.batch_created);
    assert_ne!(eleventh.batch_id, first.batch_id);

    let batches = store.list_batches(application_type_id).await.unwrap();
    assert_eq!(batches.len(), 2);
    let full = batches.iter().find(|b| b.id == first.batch_id).unwrap();
    let fresh = batches.iter().find(|b| b.id == eleventh.batch_id).unwrap();
    assert_eq!(full.total_applications, 10);
    assert_eq!(fresh.total_applications, 1);
}

#[tokio::test]
async fn test_expired_batch_is_not_reused() {
    let (store, pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();

    let first = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();

    // Age the batch so its window closed a month ago; it stays available
    // and has headroom, only the window excludes it
    let now = Utc::now();
    sqlx::query("UPDATE batches SET start_date = ?, end_date = ? WHERE id = ?")
        .bind((now - chrono::Duration::days(60)).timestamp_millis())
        .bind((now - chrono::Duration::days(30)).timestamp_millis())
        .bind(first.batch_id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let second = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();

    assert!(second.batch_created);
    assert_ne!(second.batch_id, first.batch_id);

    let batches = store.list_batches(application_type_id).await.unwrap();
    assert_eq!(batches.len(), 2);
    let stale = batches.iter().find(|b| b.id == first.batch_id).unwrap();
    let fresh = batches.iter().find(|b| b.id == second.batch_id).unwrap();
    assert_eq!(stale.total_applications, 1);
    assert_eq!(fresh.total_applications, 1);
}

#[tokio::test]
async fn test_batch_window_end_is_exclusive() {
    let (store, pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();

    let first = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();

    // A window ending at this very instant no longer admits assignments
    let now = Utc::now();
    sqlx::query("UPDATE batches SET start_date = ?, end_date = ? WHERE id = ?")
        .bind((now - chrono::Duration::days(30)).timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(first.batch_id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let second = store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();

    assert!(second.batch_created);
    assert_ne!(second.batch_id, first.batch_id);
}

#[tokio::test]
async fn test_application_types_never_share_a_batch() {
    let (store, _pool) = memory_store().await;
    let rice = Uuid::new_v4();
    let corn = Uuid::new_v4();

    let rice_receipt = store.create_case(&submission_for(rice)).await.unwrap();
    let corn_receipt = store.create_case(&submission_for(corn)).await.unwrap();

    assert_ne!(rice_receipt.batch_id, corn_receipt.batch_id);
    assert!(corn_receipt.batch_created);

    let rice_batches = store.list_batches(rice).await.unwrap();
    assert_eq!(rice_batches.len(), 1);
    assert_eq!(rice_batches[0].application_type_id, rice);
}

// ============================================================================
// Case Creation
// ============================================================================

#[tokio::test]
async fn test_case_aggregate_carries_four_empty_details() {
    let (store, _pool) = memory_store().await;
    let submission = submission_for(Uuid::new_v4());

    let receipt = store.create_case(&submission).await.unwrap();
    let aggregate = store
        .load_case(receipt.case_id)
        .await
        .unwrap()
        .expect("aggregate should exist");

    assert_eq!(aggregate.case.id, receipt.case_id);
    assert_eq!(aggregate.verification.case_id, receipt.case_id);
    assert_eq!(aggregate.inspection.case_id, receipt.case_id);
    assert_eq!(aggregate.policy.case_id, receipt.case_id);
    assert_eq!(aggregate.claim.case_id, receipt.case_id);

    assert!(aggregate.verification.verifier_id.is_none());
    assert!(aggregate.verification.verified_at.is_none());
    assert!(aggregate.inspection.inspector_name.is_none());
    assert!(aggregate.policy.policy_number.is_none());
    assert!(aggregate.claim.claim_amount.is_none());
}

#[tokio::test]
async fn test_ai_flag_follows_analysis_artifacts() {
    let (store, _pool) = memory_store().await;

    let mut with_artifacts = submission_for(Uuid::new_v4());
    with_artifacts.object_keys_for_ai_analysis = Some(vec!["uploads/field-1.jpg".to_string()]);
    let receipt = store.create_case(&with_artifacts).await.unwrap();
    let case = store.load_case(receipt.case_id).await.unwrap().unwrap().case;
    assert!(case.is_ai_processed);

    let mut empty_list = submission_for(Uuid::new_v4());
    empty_list.object_keys_for_ai_analysis = Some(vec![]);
    let receipt = store.create_case(&empty_list).await.unwrap();
    let case = store.load_case(receipt.case_id).await.unwrap().unwrap().case;
    assert!(!case.is_ai_processed);
}

#[tokio::test]
async fn test_duplicate_submission_is_rejected_without_consuming_capacity() {
    let (store, pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();
    let submission = submission_for(application_type_id);

    store.create_case(&submission).await.unwrap();
    let error = store.create_case(&submission).await.unwrap_err();

    match error {
        StoreError::DuplicateSubmission(id) => assert_eq!(id, submission.submission_id),
        other => panic!("expected duplicate error, got {other:?}"),
    }
    assert!(!error.is_retryable());

    // The rolled-back attempt must not leave a claimed slot or extra rows
    let batches = store.list_batches(application_type_id).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].total_applications, 1);
    assert_eq!(table_count(&pool, "cases").await, 1);
    assert_eq!(table_count(&pool, "outbox").await, 1);
}

#[tokio::test]
async fn test_failed_intake_leaves_no_partial_rows() {
    let (store, pool) = memory_store().await;
    let application_type_id = Uuid::new_v4();

    store
        .create_case(&submission_for(application_type_id))
        .await
        .unwrap();

    // Break the last insert of the transaction
    sqlx::query("DROP TABLE claims").execute(&pool).await.unwrap();
    let result = store.create_case(&submission_for(application_type_id)).await;
    assert!(result.is_err());

    assert_eq!(table_count(&pool, "cases").await, 1);
    assert_eq!(table_count(&pool, "verifications").await, 1);
    assert_eq!(table_count(&pool, "inspections").await, 1);
    assert_eq!(table_count(&pool, "policies").await, 1);
    assert_eq!(table_count(&pool, "outbox").await, 1);

    let batches = store.list_batches(application_type_id).await.unwrap();
    assert_eq!(batches[0].total_applications, 1);
}

// ============================================================================
// Capacity Invariants
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_intake_never_overfills_batches() {
    let (store, _pool) = memory_store().await;
    let store = Arc::new(store);
    let application_type_id = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..25 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.create_case(&submission_for(application_type_id)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let batches = store.list_batches(application_type_id).await.unwrap();
    let total: i32 = batches.iter().map(|b| b.total_applications).sum();
    assert_eq!(total, 25);
    for batch in &batches {
        assert!(
            batch.total_applications <= batch.max_applications,
            "batch {} holds {} of max {}",
            batch.name,
            batch.total_applications,
            batch.max_applications
        );
    }
}

// ============================================================================
// Outbox Rows
// ============================================================================

#[tokio::test]
async fn test_intake_stages_a_lifecycle_notification() {
    let (store, _pool) = memory_store().await;
    let submission = submission_for(Uuid::new_v4());

    let receipt = store.create_case(&submission).await.unwrap();

    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let record = &pending[0];
    assert_eq!(record.event_type, EVENT_APPLICATION_RECEIVED);
    assert_eq!(record.topic, TOPIC_APPLICATION_LIFECYCLE);
    assert_eq!(
        record.message_group.as_deref(),
        Some(submission.submission_id.to_string().as_str())
    );
    assert_eq!(record.status, OutboxStatus::PENDING);
    assert_eq!(record.retry_count, 0);

    assert_eq!(record.payload["provider"], "PCIC");
    assert_eq!(record.payload["status"], "PENDING");
    assert_eq!(
        record.payload["submissionId"],
        submission.submission_id.to_string()
    );
    assert_eq!(record.payload["userId"], submission.user_id.to_string());
    let received_at = record.payload["receivedAt"].as_str().unwrap();
    let received_at = chrono::DateTime::parse_from_rfc3339(received_at).unwrap();
    assert_eq!(
        received_at.timestamp_millis(),
        receipt.received_at.timestamp_millis()
    );
}

#[tokio::test]
async fn test_outbox_rows_move_through_relay_states() {
    let (store, _pool) = memory_store().await;
    store.create_case(&submission_for(Uuid::new_v4())).await.unwrap();
    store.create_case(&submission_for(Uuid::new_v4())).await.unwrap();

    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 2);
    let first = pending[0].id;
    let second = pending[1].id;

    store.mark_processing(vec![first, second]).await.unwrap();
    assert!(store.fetch_pending(10).await.unwrap().is_empty());

    store
        .update_status(first, OutboxStatus::COMPLETED, None)
        .await
        .unwrap();
    store
        .update_status(second, OutboxStatus::FAILED, Some("queue unreachable".to_string()))
        .await
        .unwrap();
    assert!(store.fetch_pending(10).await.unwrap().is_empty());

    // A failed row below the retry ceiling goes back to pending
    let requeued = store.requeue_failed(5).await.unwrap();
    assert_eq!(requeued, 1);
    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second);
    assert_eq!(pending[0].retry_count, 1);

    // Exhausted rows stay failed
    for _ in 0..4 {
        store
            .update_status(second, OutboxStatus::FAILED, Some("queue unreachable".to_string()))
            .await
            .unwrap();
    }
    assert_eq!(store.requeue_failed(5).await.unwrap(), 0);
    assert!(store.fetch_pending(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_pending_respects_limit() {
    let (store, _pool) = memory_store().await;
    for _ in 0..3 {
        store.create_case(&submission_for(Uuid::new_v4())).await.unwrap();
    }

    assert_eq!(store.fetch_pending(2).await.unwrap().len(), 2);
    assert_eq!(store.fetch_pending(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_recover_stuck_returns_processing_rows_to_pending() {
    let (store, _pool) = memory_store().await;
    store.create_case(&submission_for(Uuid::new_v4())).await.unwrap();

    let pending = store.fetch_pending(10).await.unwrap();
    store.mark_processing(vec![pending[0].id]).await.unwrap();

    // Fresh rows are not stuck
    assert_eq!(store.recover_stuck(Duration::from_secs(300)).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.recover_stuck(Duration::from_millis(5)).await.unwrap(), 1);

    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
}
