use uuid::Uuid;

use thiserror::Error;

use crate::item::StageKind;

/// Application-wide error types for the Argus pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Channel source call failed (network, protocol).
    #[error("Source error: {0}")]
    SourceError(String),

    /// The channel source reported its own rate limit.
    #[error("Source rate limited")]
    SourceRateLimited,

    /// Channel source rejected our credentials.
    #[error("Auth error: {0}")]
    AuthError(String),

    /// The rate limiter could not grant tokens within the caller's timeout.
    #[error("Rate limiter timed out after {waited_ms} ms")]
    RateLimitTimeout { waited_ms: u64 },

    /// A heavyweight inference resource failed to load.
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// An inference collaborator call failed.
    #[error("Inference error: {message}")]
    Inference { message: String, retryable: bool },

    /// A stage attempt exceeded its deadline.
    #[error("Stage timed out after {0} seconds")]
    Timeout(u64),

    /// Malformed input that no retry will fix.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Content type the pipeline cannot process.
    #[error("Unsupported content: {0}")]
    UnsupportedContent(String),

    /// Sink write failed.
    #[error("Persist error: {0}")]
    PersistError(String),

    /// Lost a race on a state transition; another worker claimed the unit of work.
    #[error("Stale transition for item {item_id} stage {stage}")]
    StaleTransition { item_id: Uuid, stage: StageKind },

    /// An item with the same source key already exists.
    ///
    /// Ingestion treats this as an idempotent no-op; the variant exists for
    /// callers that need to distinguish re-ingestion from first sight.
    #[error("Duplicate item, existing id {existing}")]
    DuplicateItem { existing: Uuid },

    /// Bad or missing configuration.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PipelineError {
    /// Returns true if this error is transient and worth retrying.
    ///
    /// Drives the Retryable/Permanent split: the scheduler retries only
    /// retryable stage failures, up to the stage's `max_retries`.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::SourceError(_)
            | PipelineError::SourceRateLimited
            | PipelineError::RateLimitTimeout { .. }
            | PipelineError::ModelLoad(_)
            | PipelineError::Timeout(_)
            | PipelineError::PersistError(_) => true,
            PipelineError::Inference { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true for the lost-race marker that the scheduler silently skips.
    pub fn is_stale_transition(&self) -> bool {
        matches!(self, PipelineError::StaleTransition { .. })
    }
}
