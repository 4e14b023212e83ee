pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod runner;
pub mod service;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use consumer::{DeadLetterSink, EventConsumer, QueueMessage};
pub use dispatch::{DispatchTable, EventHandler, HandleOutcome};
pub use error::{IntakeError, Result};
pub use runner::{IntakeRunner, RunnerConfig};
pub use service::IntakeService;
