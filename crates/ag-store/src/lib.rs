pub mod batching;
pub mod error;
pub mod model;
pub mod repository;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::{Result, StoreError};
pub use model::{
    BatchAssignment, BatchRecord, CaseAggregate, CaseRecord, ClaimRecord, InspectionRecord,
    IntakeReceipt, PolicyRecord, VerificationRecord,
};
pub use repository::{CaseStore, OutboxStore};
