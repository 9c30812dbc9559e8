use std::future::Future;

use crate::error::PipelineError;
use crate::item::{ContentItem, OutputRef, StageKind};

/// Result of a successful stage invocation: the payload handed to the sink
/// plus the opaque reference the tracker records.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub reference: OutputRef,
    pub payload: serde_json::Value,
}

impl StageOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            reference: OutputRef::generate(),
            payload,
        }
    }
}

/// Uniform contract for the enrichment stages.
///
/// Executors are pure with respect to the item tracker: they receive a
/// read-only snapshot of the item and return an outcome; the scheduler
/// applies it. Errors are classified by [`PipelineError::is_retryable`] —
/// the scheduler retries only retryable failures, with the stage's backoff.
pub trait StageExecutor: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Return `Some(reason)` when this stage should be bypassed for the item
    /// (e.g. no media attached). The scheduler records the stage as Skipped,
    /// which satisfies downstream dependencies the same as Done.
    fn skip(&self, _item: &ContentItem) -> Option<String> {
        None
    }

    fn run(
        &self,
        item: &ContentItem,
    ) -> impl Future<Output = Result<StageOutput, PipelineError>> + Send;
}
