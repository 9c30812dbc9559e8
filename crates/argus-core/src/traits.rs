use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::item::{MediaRef, RawMessage};

/// One page of raw items from the external content source.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub messages: Vec<RawMessage>,
    pub next_cursor: Option<String>,
}

/// Fetches raw items from an external channel.
///
/// The pipeline never calls this without first holding rate-limiter tokens.
pub trait ChannelSource: Send + Sync + Clone {
    fn fetch(
        &self,
        channel: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<SourcePage, PipelineError>> + Send;
}

/// A recognized entity span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub label: String,
    pub text: String,
    pub span: (usize, usize),
    pub confidence: f32,
}

/// Text classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub confidence: f32,
}

/// An entity resolved against the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedEntity {
    pub text: String,
    pub label: String,
    pub kb_id: String,
}

/// A (subject, predicate, object) triple between recognized entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// One detected object in an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box as (x, y, width, height) in pixels.
    pub bbox: [f32; 4],
    pub label: String,
    pub score: f32,
}

/// Text inference collaborator: opaque scoring functions consumed by the
/// text-enrichment sub-chain. Calls are synchronous and potentially slow;
/// the stage's bounded worker pool limits how many run at once.
pub trait TextInference: Send + Sync {
    fn infer_entities(&self, text: &str) -> Result<Vec<Entity>, PipelineError>;

    fn classify(&self, text: &str) -> Result<Classification, PipelineError>;

    /// Resolve an entity surface form to a knowledge-base id, if any.
    fn link(&self, entity_text: &str) -> Result<Option<String>, PipelineError>;

    fn relate(&self, entities: &[Entity]) -> Result<Vec<Relation>, PipelineError>;
}

/// Image inference collaborator.
pub trait ImageInference: Send + Sync {
    /// Detect objects above the caller-supplied confidence threshold.
    fn detect(&self, media: &MediaRef, threshold: f32) -> Result<Vec<Detection>, PipelineError>;
}
