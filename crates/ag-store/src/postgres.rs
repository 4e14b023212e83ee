use std::time::Duration;

use ag_common::{
    ApplicationReceived, ApplicationSubmitted, CaseStatus, OutboxRecord, OutboxStatus,
    EVENT_APPLICATION_RECEIVED, TOPIC_APPLICATION_LIFECYCLE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::batching;
use crate::error::{map_case_insert_error, Result, StoreError};
use crate::model::{
    BatchAssignment, BatchRecord, CaseAggregate, CaseRecord, ClaimRecord, InspectionRecord,
    IntakeReceipt, PolicyRecord, VerificationRecord,
};
use crate::repository::{CaseStore, OutboxStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS batches (
        id UUID PRIMARY KEY,
        application_type_id UUID NOT NULL,
        provider TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        total_applications INTEGER NOT NULL DEFAULT 0,
        max_applications INTEGER NOT NULL DEFAULT 10,
        is_available BOOLEAN NOT NULL DEFAULT TRUE,
        start_date TIMESTAMPTZ NOT NULL,
        end_date TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_batches_type_window ON batches(application_type_id, start_date, end_date)",
    r#"
    CREATE TABLE IF NOT EXISTS cases (
        id UUID PRIMARY KEY,
        submission_id UUID NOT NULL UNIQUE,
        application_type_id UUID NOT NULL,
        application_type_name TEXT NOT NULL,
        provider TEXT NOT NULL,
        farmer_id UUID NOT NULL,
        farmer_name TEXT NOT NULL,
        current_status TEXT NOT NULL,
        is_ai_processed BOOLEAN NOT NULL DEFAULT FALSE,
        batch_id UUID NOT NULL REFERENCES batches(id),
        submitted_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS verifications (
        id UUID PRIMARY KEY,
        case_id UUID NOT NULL REFERENCES cases(id),
        verifier_id UUID,
        verifier_name TEXT,
        remarks TEXT,
        verification_documents TEXT,
        field_values TEXT,
        verified_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inspections (
        id UUID PRIMARY KEY,
        case_id UUID NOT NULL REFERENCES cases(id),
        inspector_id UUID,
        inspector_name TEXT,
        inspected_at TIMESTAMPTZ,
        photos TEXT,
        field_values TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS policies (
        id UUID PRIMARY KEY,
        case_id UUID NOT NULL REFERENCES cases(id),
        policy_number TEXT,
        effective_date TIMESTAMPTZ,
        expiry_date TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS claims (
        id UUID PRIMARY KEY,
        case_id UUID NOT NULL REFERENCES cases(id),
        filed_at TIMESTAMPTZ,
        damage_assessment TEXT,
        claim_amount DOUBLE PRECISION,
        supporting_files TEXT,
        field_values TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        topic TEXT NOT NULL,
        message_group TEXT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, created_at)",
];

pub struct PostgresCaseStore {
    pool: PgPool,
}

impl PostgresCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Batch-selection step of the intake transaction. Scans open batches
    /// oldest first and claims a slot with a single conditional UPDATE; the
    /// claim re-checks capacity inside the database, so a candidate that
    /// filled up concurrently just reports zero affected rows and the scan
    /// moves on. When nothing is claimable a fresh batch is inserted.
    async fn assign_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        application_type_id: Uuid,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<BatchAssignment> {
        let rows = sqlx::query(
            "SELECT id, application_type_id, provider, name, description, total_applications, \
             max_applications, is_available, start_date, end_date, created_at \
             FROM batches \
             WHERE application_type_id = $1 AND start_date <= $2 AND end_date > $2 \
             ORDER BY created_at",
        )
        .bind(application_type_id)
        .bind(now)
        .fetch_all(&mut **tx)
        .await?;

        for row in rows {
            let candidate = map_batch_row(&row)?;
            if !batching::has_capacity(&candidate) {
                continue;
            }

            let claimed = sqlx::query(
                "UPDATE batches SET total_applications = total_applications + 1 \
                 WHERE id = $1 AND is_available AND total_applications < max_applications",
            )
            .bind(candidate.id)
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(batch.id)
        .bind(batch.application_type_id)
        .bind(&batch.provider)
        .bind(&batch.name)
        .bind(&batch.description)
        .bind(batch.total_applications)
        .bind(batch.max_applications)
        .bind(batch.is_available)
        .bind(batch.start_date)
        .bind(batch.end_date)
        .bind(batch.created_at)
        .execute(&mut **tx)
        .await?;

        debug!(batch_id = %batch.id, batch = %batch.name, "Created batch");
        Ok(BatchAssignment {
            batch_id: batch.id,
            batch_name: batch.name,
            created: true,
        })
    }

    async fn insert_details(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        case_id: Uuid,
    ) -> Result<()> {
        sqlx::query("INSERT INTO verifications (id, case_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(case_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO inspections (id, case_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(case_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO policies (id, case_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(case_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("INSERT INTO claims (id, case_id) VALUES ($1, $2)")
            .bind(Uuid::new_v4())
            .bind(case_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_outbox_row(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        submission: &ApplicationSubmitted,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        let notification = ApplicationReceived::pending(submission, received_at);
        let payload = serde_json::to_string(&notification)?;

        sqlx::query(
            "INSERT INTO outbox (id, event_type, topic, message_group, payload, status, \
             retry_count, created_at) VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6)",
        )
        .bind(Uuid::new_v4())
        .bind(EVENT_APPLICATION_RECEIVED)
        .bind(TOPIC_APPLICATION_LIFECYCLE)
        .bind(submission.submission_id.to_string())
        .bind(payload)
        .bind(received_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CaseStore for PostgresCaseStore {
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(case_id)
        .bind(submission.submission_id)
        .bind(submission.application_type_id)
        .bind(&submission.application_type_name)
        .bind(&submission.provider)
        .bind(submission.user_id)
        .bind(&submission.full_name)
        .bind(CaseStatus::Pending.as_str())
        .bind(submission.has_ai_artifacts())
        .bind(assignment.batch_id)
        .bind(submission.submitted_at)
        .bind(now)
        .bind(now)
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
             created_at, updated_at FROM cases WHERE submission_id = $1",
        )
        .bind(submission_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_case_row(&r)).transpose()
    }

    async fn load_case(&self, case_id: Uuid) -> Result<Option<CaseAggregate>> {
        let case_row = sqlx::query(
            "SELECT id, submission_id, application_type_id, application_type_name, provider, \
             farmer_id, farmer_name, current_status, is_ai_processed, batch_id, submitted_at, \
             created_at, updated_at FROM cases WHERE id = $1",
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;

        let case = match case_row {
            Some(row) => map_case_row(&row)?,
            None => return Ok(None),
        };

        let verification = sqlx::query(
            "SELECT id, case_id, verifier_id, verifier_name, remarks, verification_documents, \
             field_values, verified_at FROM verifications WHERE case_id = $1",
        )
        .bind(case_id)
        .fetch_one(&self.pool)
        .await?;

        let inspection = sqlx::query(
            "SELECT id, case_id, inspector_id, inspector_name, inspected_at, photos, \
             field_values FROM inspections WHERE case_id = $1",
        )
        .bind(case_id)
        .fetch_one(&self.pool)
        .await?;

        let policy = sqlx::query(
            "SELECT id, case_id, policy_number, effective_date, expiry_date \
             FROM policies WHERE case_id = $1",
        )
        .bind(case_id)
        .fetch_one(&self.pool)
        .await?;

        let claim = sqlx::query(
            "SELECT id, case_id, filed_at, damage_assessment, claim_amount, supporting_files, \
             field_values FROM claims WHERE case_id = $1",
        )
        .bind(case_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(CaseAggregate {
            case,
            verification: map_verification_row(&verification)?,
            inspection: map_inspection_row(&inspection)?,
            policy: map_policy_row(&policy),
            claim: map_claim_row(&claim)?,
        }))
    }

    async fn list_batches(&self, application_type_id: Uuid) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query(
            "SELECT id, application_type_id, provider, name, description, total_applications, \
             max_applications, is_available, start_date, end_date, created_at \
             FROM batches WHERE application_type_id = $1 ORDER BY created_at",
        )
        .bind(application_type_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_batch_row).collect()
    }
}

#[async_trait]
impl OutboxStore for PostgresCaseStore {
    async fn fetch_pending(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            "SELECT id, event_type, topic, message_group, payload, retry_count, created_at \
             FROM outbox WHERE status = 'PENDING' ORDER BY created_at LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(OutboxRecord {
                id: row.get("id"),
                event_type: row.get("event_type"),
                topic: row.get("topic"),
                message_group: row.get("message_group"),
                payload: serde_json::from_str(row.get("payload"))?,
                status: OutboxStatus::PENDING,
                retry_count: row.get::<i32, _>("retry_count") as u32,
                created_at: row.get("created_at"),
            });
        }
        Ok(records)
    }

    async fn mark_processing(&self, ids: Vec<Uuid>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE outbox SET status = 'PROCESSING', processed_at = $1 WHERE id = ANY($2)")
            .bind(Utc::now())
            .bind(&ids)
            .execute(&self.pool)
            .await?;
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
                "UPDATE outbox SET status = 'FAILED', error_message = $1, \
                 retry_count = retry_count + 1 WHERE id = $2",
            )
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE outbox SET status = $1, error_message = $2 WHERE id = $3")
                .bind(status.as_str())
                .bind(error)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn requeue_failed(&self, max_retries: u32) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', processed_at = NULL \
             WHERE status = 'FAILED' AND retry_count < $1",
        )
        .bind(max_retries as i32)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            info!("Requeued {} failed outbox rows", requeued);
        }
        Ok(requeued)
    }

    async fn recover_stuck(&self, timeout: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(timeout.as_millis() as i64);

        let result = sqlx::query(
            "UPDATE outbox SET status = 'PENDING', processed_at = NULL \
             WHERE status = 'PROCESSING' AND processed_at < $1",
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

fn map_batch_row(row: &PgRow) -> Result<BatchRecord> {
    Ok(BatchRecord {
        id: row.get("id"),
        application_type_id: row.get("application_type_id"),
        provider: row.get("provider"),
        name: row.get("name"),
        description: row.get("description"),
        total_applications: row.get("total_applications"),
        max_applications: row.get("max_applications"),
        is_available: row.get("is_available"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        created_at: row.get("created_at"),
    })
}

fn map_case_row(row: &PgRow) -> Result<CaseRecord> {
    let status_text: String = row.get("current_status");
    let current_status = CaseStatus::parse(&status_text)
        .ok_or_else(|| StoreError::UnknownStatus(status_text))?;

    Ok(CaseRecord {
        id: row.get("id"),
        submission_id: row.get("submission_id"),
        application_type_id: row.get("application_type_id"),
        application_type_name: row.get("application_type_name"),
        provider: row.get("provider"),
        farmer_id: row.get("farmer_id"),
        farmer_name: row.get("farmer_name"),
        current_status,
        is_ai_processed: row.get("is_ai_processed"),
        batch_id: row.get("batch_id"),
        submitted_at: row.get("submitted_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_verification_row(row: &PgRow) -> Result<VerificationRecord> {
    Ok(VerificationRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        verifier_id: row.get("verifier_id"),
        verifier_name: row.get("verifier_name"),
        remarks: row.get("remarks"),
        verification_documents: parse_json_column(row.get("verification_documents"))?,
        field_values: parse_json_column(row.get("field_values"))?,
        verified_at: row.get("verified_at"),
    })
}

fn map_inspection_row(row: &PgRow) -> Result<InspectionRecord> {
    Ok(InspectionRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        inspector_id: row.get("inspector_id"),
        inspector_name: row.get("inspector_name"),
        inspected_at: row.get("inspected_at"),
        photos: parse_json_column(row.get("photos"))?,
        field_values: parse_json_column(row.get("field_values"))?,
    })
}

fn map_policy_row(row: &PgRow) -> PolicyRecord {
    PolicyRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        policy_number: row.get("policy_number"),
        effective_date: row.get("effective_date"),
        expiry_date: row.get("expiry_date"),
    }
}

fn map_claim_row(row: &PgRow) -> Result<ClaimRecord> {
    Ok(ClaimRecord {
        id: row.get("id"),
        case_id: row.get("case_id"),
        filed_at: row.get("filed_at"),
        damage_assessment: row.get("damage_assessment"),
        claim_amount: row.get("claim_amount"),
        supporting_files: parse_json_column(row.get("supporting_files"))?,
        field_values: parse_json_column(row.get("field_values"))?,
    })
}

/// JSON detail columns are stored as TEXT and parsed on read
fn parse_json_column(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(StoreError::from)
}
