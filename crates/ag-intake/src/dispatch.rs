use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use ag_common::EventEnvelope;

use crate::error::{IntakeError, Result};

/// What the runner should do with the queue delivery after handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Work committed, delete the message
    Completed,
    /// Already processed by an earlier delivery, delete this one too
    Duplicate,
    /// Never processable, park it on the dead-letter queue
    Rejected { reason: String },
    /// Transient failure, leave the message for redelivery
    Retry {
        error: String,
        delay_seconds: Option<u32>,
    },
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> HandleOutcome;
}

/// Routing table from event type to handler. Built once at startup and
/// validated against the event types the worker is expected to serve, so
/// a missing registration fails the process instead of dead-lettering
/// live traffic.
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event_type.to_string(), handler);
    }

    pub fn resolve(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    /// Fails with the first expected event type that has no handler
    pub fn validate(&self, expected_types: &[&str]) -> Result<()> {
        for event_type in expected_types {
            if !self.handlers.contains_key(*event_type) {
                return Err(IntakeError::MissingHandler(event_type.to_string()));
            }
        }
        Ok(())
    }

    pub fn handled_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}
