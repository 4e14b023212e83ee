#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("no handler registered for event type '{0}'")]
    MissingHandler(String),

    #[error("queue error: {0}")]
    Queue(String),
}

pub type Result<T> = std::result::Result<T, IntakeError>;
