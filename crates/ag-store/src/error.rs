use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("submission {0} was already processed")]
    DuplicateSubmission(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("stored timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("stored id '{0}' is not a valid uuid")]
    InvalidUuid(String),

    #[error("unknown stored status '{0}'")]
    UnknownStatus(String),
}

impl StoreError {
    /// True when redelivering the triggering event may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Maps a unique-index violation on `cases.submission_id` to the typed
/// duplicate error so intake can acknowledge redeliveries.
pub(crate) fn map_case_insert_error(error: sqlx::Error, submission_id: Uuid) -> StoreError {
    if let sqlx::Error::Database(ref db_error) = error {
        if matches!(db_error.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return StoreError::DuplicateSubmission(submission_id);
        }
    }
    StoreError::Database(error)
}

pub type Result<T> = std::result::Result<T, StoreError>;
