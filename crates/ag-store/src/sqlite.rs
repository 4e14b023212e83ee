use std::time::Duration;

use ag_common::{
    ApplicationReceived, ApplicationSubmitted, CaseStatus, OutboxRecord, OutboxStatus,
    EVENT_APPLICATION_RECEIVED, TOPIC_APPLICATION_LIFECYCLE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::batching;
use crate::error::{map_case_insert_error, Result, StoreError};
use crate::model::{
    BatchAssignment, BatchRecord, CaseAggregate, CaseRecord, ClaimRecord, InspectionRecord,
    IntakeReceipt, PolicyRecord, VerificationRecord,
};
use crate::repository::{CaseStore, OutboxStore};

// Uuids are stored as their canonical text form and timestamps as unix
// epoch milliseconds, matching what the driver round-trips without
// column-type affinity surprises.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        application_type_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        total_applications INTEGER NOT NULL DEFAULT 0,
        max_applications INTEGER NOT NULL DEFAULT 10,
        is_available INTEGER NOT NULL DEFAULT 1,
        start_date BIGINT NOT NULL,
        end_date BIGINT NOT NULL,
        created_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_batches_type_window ON batches(application_type_id, start_date, end_date)",
    r#"
    CREATE TABLE IF NOT EXISTS cases (
        id TEXT PRIMARY KEY,
        submission_id TEXT NOT NULL UNIQUE,
        application_type_id TEXT NOT NULL,
        application_type_name TEXT NOT NULL,
        provider TEXT NOT NULL,
        farmer_id TEXT NOT NULL,
        farmer_name TEXT NOT NULL,
        current_status TEXT NOT NULL,
        is_ai_processed INTEGER NOT NULL DEFAULT 0,
        batch_id TEXT NOT NULL REFERENCES batches(id),
        submitted_at BIGINT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS verifications (
        id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(id),
        verifier_id TEXT,
        verifier_name TEXT,
        remarks TEXT,
        verification_documents TEXT,
        field_values TEXT,
        verified_at BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inspections (
        id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(id),
        inspector_id TEXT,
        inspector_name TEXT,
        inspected_at BIGINT,
        photos TEXT,
        field_values TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS policies (
        id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(id),
        policy_number TEXT,
        effective_date BIGINT,
        expiry_date BIGINT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS claims (
        id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL REFERENCES cases(id),
        filed_at BIGINT,
        damage_assessment TEXT,
        claim_amount REAL,
        supporting_files TEXT,
        field_values TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        topic TEXT NOT NULL,
        message_group TEXT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at BIGINT NOT NULL,
        processed_at BIGINT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, created_at)",
];

pub struct SqliteCaseStore {
    pool: SqlitePool,
}

impl SqliteCaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// See `PostgresCaseStore::assign_batch`; same scan-then-claim shape
    /// with text ids and millisecond timestamps.
    async fn assign_batch(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        application_type_id: Uuid,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<BatchAssignment> {
        let now_millis = now.timestamp_millis();
        let rows = sqlx::query(
            "SELECT id, application_type_id, provider, name, description, total_applications, \
             max_applications, is_available, start_date, end_date, created_at \
             FROM batches \
             WHERE application_type_id = ? AND start_date <= ? AND end_date > ? \
             ORDER BY created_at",
        )
        .bind(application_type_id.to_string())
        .bind(now_millis)
        .bind(now_millis)
        .fetch_all(&mut **tx)
        .await?;

        for row in rows {
            let candidate = map_batch_row(&row)?;
            if !batching::has_capacity(&candidate) {
                continue;
            }

            let claimed = sqlx::query(
                "UPDATE batches SET total_applications = total_applications + 1 \
                 WHERE id = ? AND is_available AND total_applications < max_applications",
            )
            .bind(candidate.id.to_string())
            .execute(&mut **tx)
            .await?;

            if claimed.rows_affected() == 1 {
                debug!(batch_id = %candidate.id, batch = %candidate.name, "Claimed batch slot");
                return Ok(BatchAssignment {
                    batch_id: candidate.id,
                    batch_name: candidate.name,
                    created: false,
                });
            }
        }

        let batch = batching::first_batch(application_type_id, provider, now);
        sqlx::query(
            "INSERT INTO batches (id, application_type_id, provider, name, description, \
             total_applications, max_applications, is_available, start_date, end_date, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch.id.to_string())
        .bind(batch.application_type_id.to_string())
        .bind(&batch.provider)
        .bind(&batch.name)
        .bind(&batch.description)
        .bind(batch.total_applications)
        .bind(batch.max_applications)
        .bind(batch.is_available)
        .bind(batch.start_date.timestamp_millis())
        .bind(batch.end_date.timestamp_millis())
        .bind(batch.created_at.timestamp_millis())
        .execute(&mut **tx)
        .await?;

        debug!(batch_id = %batch.id, batch = %batch.name, "Created batch");
        Ok(BatchAssignment {
            batch_id: batch.id,
            batch_name: batch.name,
            created: true,
        })
    }

    async fn insert_details(&self, tx: &mut Transaction<'_, Sqlite>, case_id: Uuid) -> Result<()> {
        let case_id = case_id.to_string();
        sqlx::query("INSERT INTO verifications (id, case_id) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&case_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO inspections (id, case_id) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&case_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO policies (id, case_id) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&case_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO claims (id, case_id) VALUES (?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&case_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_outbox_row(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        submission: &ApplicationSubmitted,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        let notification = ApplicationReceived::pending(submission, received_at);
        let payload = serde_json::to_string(&notification)?;

        sqlx::query(
            "INSERT INTO outbox (id, event_type, topic, message_group, payload, status, \
             retry_count, created_at) VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(EVENT_APPLICATION_RECEIVED)
        .bind(TOPIC_APPLICATION_LIFECYCLE)
        .bind(submission.submission_id.to_string())
        .bind(payload)
        .bind(received_at.timestamp_millis())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CaseStore for SqliteCaseStore {
    async fn create_case(&self, submission: &ApplicationSubmitted) -> Result<IntakeReceipt> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let assignment = self
            .assign_batch(
                &mut tx,
                submission.application_type_id,
                &submission.provider,
                now,
            )
            .await?;

        let case_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO cases (id, submission_id, application_type_id, application_type_name, \
             provider, farmer_id, farmer_name, current_status, is_ai_processed, batch_id, \
             submitted_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(case_id.to_string())
        .bind(submission.submission_id.to_string())
        .bind(submission.application_type_id.to_string())
        .bind(&submission.application_type_name)
        .bind(&submission.provider)
        .bind(submission.user_id.to_string())
        .bind(&submission.full_name)
        .bind(CaseStatus::Pending.as_str())
        .bind(submission.has_ai_artifacts())
        .bind(assignment.batch_id.to_string())
        .bind(submission.submitted_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_case_insert_error(e, submission.submission_id))?;

        self.insert_details(&mut tx, case_id).await?;
        self.insert_outbox_row(&mut tx, submission, now).await?;

        tx.commit().await?;

        Ok(IntakeReceipt {
            case_id,
            batch_id: assignment.batch_id,
            batch_name: assignment.batch_name,
            batch_created: assignment.created,
            received_at: now,
        })
    }

    async fn find_case_by_submission(&self, submission_id: Uuid) -> Result<Option<CaseRecord>> {
        let row = sqlx::query(
            "SELECT id, submission_id, application_type_id, application_type_name, provider, \
             farmer_id, farmer_name, current_status, is_ai_processed, batch_id, submitted_at, \
             created_at, updated_at FROM cases WHERE submission_id = ?",
        )
        .bind(submission_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_case_row(&r)).transpose()
    }

    async fn load_case(&self, case_id: Uuid) -> Result<Option<CaseAggregate>> {
        let case_row = sqlx::query(
            "SELECT id, submission_id, application_type_id, application_type_name, provider, \
             farmer_id, farmer_name, current_status, is_ai_processed, batch_id, submitted_at, \
             created_at, updated_at FROM cases WHERE id = ?",
        )
        .bind(case_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let case = match case_row {
            Some(row) => map_case_row(&row)?,
            None => return Ok(None),
        };

        let verification = sqlx::query(
            "SELECT id, case_id, verifier_id, verifier_name, remarks, verification_documents, \
             field_values, verified_at FROM verifications WHERE case_id = ?",
        )
        .bind(case_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let inspection = sqlx::query(
            "SELECT id, case_id, inspector_id, inspector_name, inspected_at, photos, \
             field_values FROM inspections WHERE case_id = ?",
        )
        .bind(case_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let policy = sqlx::query(
            "SELECT id, case_id, policy_number, effective_date, expiry_date \
             FROM policies WHERE case_id = ?",
        )
        .bind(case_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        let claim = sqlx::query(
            "SELECT id, case_id, filed_at, damage_assessment, claim_amount, supporting_files, \
             field_values FROM claims WHERE case_id = ?",
        )
        .bind(case_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(CaseAggregate {
            case,
            verification: map_verification_row(&verification)?,
            inspection: map_inspection_row(&inspection)?,
            policy: map_policy_row(&policy)?,
            claim: map_claim_row(&claim)?,
        }))
    }

    async fn list_batches(&self, application_type_id: Uuid) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(
            "SELECT id, application_type_id, provider, name, description, total_applications, \
             max_applications, is_available, start_date, end_date, created_at \
             FROM batches WHERE application_type_id = ? ORDER BY created_at",
        )
        .bind(application_type_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_batch_row).collect()
    }
}

#[async_trait]
impl OutboxStore for SqliteCaseStore {
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            "SELECT id, event_type, topic, message_group, payload, retry_count, created_at \
             FROM outbox WHERE status = 'PENDING' ORDER BY created_at LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(OutboxRecord {
                id: parse_uuid(row.get("id"))?,
                event_type: row.get("event_type"),
                topic: row.get("topic"),
                message_group: row.get("message_group"),
                payload: serde_json::from_str(row.get("payload"))?,
                status: OutboxStatus::PENDING,
                retry_count: row.get::<i64, _>("retry_count") as u32,
                created_at: from_millis(row.get("created_at"))?,
            });
        }
        Ok(records)
    }

    async fn mark_processing(&self, ids: Vec<Uuid>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE outbox SET status = 'PROCESSING', processed_at = ? WHERE id IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(Utc::now().timestamp_millis());
        for id in &ids {
            query = query.bind(id.to_string());
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: OutboxStatus,
        error: Option<String>,
    ) -> Result<()> {
        if matches!(status, OutboxStatus::FAILED) {
            sqlx::query(
                "UPDATE outbox SET status = 'FAILED', error_message = ?, \
                 retry_count = retry_count + 1 WHERE id = ?",
            )
            .bind(error)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE outbox SET status = ?, error_message = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn requeue_failed(&self, max_retries: u32) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', processed_at = NULL \
             WHERE status = 'FAILED' AND retry_count < ?",
        )
        .bind(max_retries as i64)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            info!("Requeued {} failed outbox rows", requeued);
        }
        Ok(requeued)
    }

    async fn recover_stuck(&self, timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - timeout.as_millis() as i64;

        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', processed_at = NULL \
             WHERE status = 'PROCESSING' AND processed_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Recovered {} stuck outbox rows", recovered);
        }
        Ok(recovered)
    }
}

fn parse_uuid(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|_| StoreError::InvalidUuid(raw))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(StoreError::InvalidTimestamp(millis))
}

fn from_millis_opt(millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

fn parse_uuid_opt(raw: Option<String>) -> Result<Option<Uuid>> {
    raw.map(parse_uuid).transpose()
}

fn parse_json_column(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(StoreError::from)
}

fn map_batch_row(row: &SqliteRow) -> Result<BatchRecord> {
    Ok(BatchRecord {
        id: parse_uuid(row.get("id"))?,
        application_type_id: parse_uuid(row.get("application_type_id"))?,
        provider: row.get("provider"),
        name: row.get("name"),
        description: row.get("description"),
        total_applications: row.get("total_applications"),
        max_applications: row.get("max_applications"),
        is_available: row.get("is_available"),
        start_date: from_millis(row.get("start_date"))?,
        end_date: from_millis(row.get("end_date"))?,
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn map_case_row(row: &SqliteRow) -> Result<CaseRecord> {
    let status_text: String = row.get("current_status");
    let current_status = CaseStatus::parse(&status_text)
        .ok_or_else(|| StoreError::UnknownStatus(status_text))?;

    Ok(CaseRecord {
        id: parse_uuid(row.get("id"))?,
        submission_id: parse_uuid(row.get("submission_id"))?,
        application_type_id: parse_uuid(row.get("application_type_id"))?,
        application_type_name: row.get("application_type_name"),
        provider: row.get("provider"),
        farmer_id: parse_uuid(row.get("farmer_id"))?,
        farmer_name: row.get("farmer_name"),
        current_status,
        is_ai_processed: row.get("is_ai_processed"),
        batch_id: parse_uuid(row.get("batch_id"))?,
        submitted_at: from_millis(row.get("submitted_at"))?,
        created_at: from_millis(row.get("created_at"))?,
        updated_at: from_millis(row.get("updated_at"))?,
    })
}

fn map_verification_row(row: &SqliteRow) -> Result<VerificationRecord> {
    Ok(VerificationRecord {
        id: parse_uuid(row.get("id"))?,
        case_id: parse_uuid(row.get("case_id"))?,
        verifier_id: parse_uuid_opt(row.get("verifier_id"))?,
        verifier_name: row.get("verifier_name"),
        remarks: row.get("remarks"),
        verification_documents: parse_json_column(row.get("verification_documents"))?,
        field_values: parse_json_column(row.get("field_values"))?,
        verified_at: from_millis_opt(row.get("verified_at"))?,
    })
}

fn map_inspection_row(row: &SqliteRow) -> Result<InspectionRecord> {
    Ok(InspectionRecord {
        id: parse_uuid(row.get("id"))?,
        case_id: parse_uuid(row.get("case_id"))?,
        inspector_id: parse_uuid_opt(row.get("inspector_id"))?,
        inspector_name: row.get("inspector_name"),
        inspected_at: from_millis_opt(row.get("inspected_at"))?,
        photos: parse_json_column(row.get("photos"))?,
        field_values: parse_json_column(row.get("field_values"))?,
    })
}

fn map_policy_row(row: &SqliteRow) -> Result<PolicyRecord> {
    Ok(PolicyRecord {
        id: parse_uuid(row.get("id"))?,
        case_id: parse_uuid(row.get("case_id"))?,
        policy_number: row.get("policy_number"),
        effective_date: from_millis_opt(row.get("effective_date"))?,
        expiry_date: from_millis_opt(row.get("expiry_date"))?,
    })
}

fn map_claim_row(row: &SqliteRow) -> Result<ClaimRecord> {
    Ok(ClaimRecord {
        id: parse_uuid(row.get("id"))?,
        case_id: parse_uuid(row.get("case_id"))?,
        filed_at: from_millis_opt(row.get("filed_at"))?,
        damage_assessment: row.get("damage_assessment"),
        claim_amount: row.get("claim_amount"),
        supporting_files: parse_json_column(row.get("supporting_files"))?,
        field_values: parse_json_column(row.get("field_values"))?,
    })
}
