use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Which side of a bounded queue gave up waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    /// The writer, blocked in `offer`
    Producer,
    /// The reader, blocked in `has_next`
    Consumer,
}

impl std::fmt::Display for QueueSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueSide::Producer => f.write_str("producer"),
            QueueSide::Consumer => f.write_str("consumer"),
        }
    }
}

/// Errors that can occur while building or running a pipeline
///
/// The type is `Clone` so one failure can be handed to every queue the
/// cascade interrupts.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Pipeline has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// No stages were appended after the source
    #[error("Cannot build pipeline with no stages")]
    NoStages,

    /// Stage logic failed
    #[error("Stage execution failed: {0}")]
    StageError(String),

    /// I/O failure inside a stage
    #[error("Stage I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A blocked queue side exhausted its retry budget
    #[error("Backpressure timeout on queue '{queue}': {side} waited {waited:?} without progress")]
    BackpressureTimeout {
        queue: String,
        side: QueueSide,
        waited: Duration,
    },

    /// Another stage failed and the cascade cancelled this one
    #[error("Interrupted by pipeline failure: {0}")]
    Interrupted(Box<PipelineError>),

    /// Envelope offered to a queue that was already finished
    #[error("Queue '{0}' is already finished")]
    QueueFinished(String),

    /// Invalid pipeline layout or queue configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Worker thread could not be spawned, joined, or panicked
    #[error("Thread error: {0}")]
    ThreadError(String),
}

impl PipelineError {
    /// Shorthand for a stage-logic failure
    pub fn stage(message: impl Into<String>) -> Self {
        PipelineError::StageError(message.into())
    }

    /// Strip any `Interrupted` wrappers and return the failure that started the cascade
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::Interrupted(cause) => cause.root_cause(),
            other => other,
        }
    }

    /// Whether this error is a cascaded cancellation rather than an original failure
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PipelineError::Interrupted(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(Arc::new(err))
    }
}
