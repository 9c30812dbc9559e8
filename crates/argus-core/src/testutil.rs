//! Test utilities: mock implementations of the pipeline collaborators.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability so clones share
//! scripts and recorded calls. Scripted response queues pop front-to-back;
//! an exhausted queue falls back to a benign default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use url::Url;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::item::{ContentItem, MediaRef, RawMessage, StageKind};
use crate::model_cache::ModelLoader;
use crate::sink::{MemorySink, Sink};
use crate::stage::{StageExecutor, StageOutput};
use crate::traits::{
    ChannelSource, Classification, Detection, Entity, ImageInference, Relation, SourcePage,
    TextInference,
};

/// A raw text-only message for a channel.
pub fn make_raw_message(channel: &str, external_id: &str, text: &str) -> RawMessage {
    RawMessage {
        channel: channel.to_string(),
        external_id: external_id.to_string(),
        text: Some(text.to_string()),
        media: Vec::new(),
        posted_at: None,
    }
}

/// A raw message carrying `images` media attachments and no text.
pub fn make_media_message(channel: &str, external_id: &str, images: usize) -> RawMessage {
    let media = (0..images)
        .map(|i| MediaRef {
            url: Url::parse(&format!("https://cdn.example.org/{channel}/{external_id}/{i}.jpg"))
                .expect("static url"),
            mime: Some("image/jpeg".to_string()),
        })
        .collect();
    RawMessage {
        channel: channel.to_string(),
        external_id: external_id.to_string(),
        text: None,
        media,
        posted_at: None,
    }
}

/// One source page holding text-only messages with sequential external ids.
pub fn page_of_texts(channel: &str, texts: &[&str]) -> SourcePage {
    SourcePage {
        messages: texts
            .iter()
            .enumerate()
            .map(|(i, text)| make_raw_message(channel, &format!("{}", i + 1), text))
            .collect(),
        next_cursor: None,
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

type SourceScript = Vec<Result<SourcePage, PipelineError>>;

/// Mock channel source with a scripted response queue per channel.
///
/// An exhausted or unscripted channel yields an empty page.
#[derive(Clone, Default)]
pub struct MockSource {
    scripts: Arc<Mutex<HashMap<String, SourceScript>>>,
    default_script: Arc<Mutex<SourceScript>>,
    /// (channel, cursor) of every fetch, for assertions.
    fetches: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose `channel` serves one page of text-only messages.
    pub fn with_texts(channel: &str, texts: &[&str]) -> Self {
        let source = Self::new();
        source.push_page(channel, page_of_texts(channel, texts));
        source
    }

    /// A source that fails every channel once with `error`.
    pub fn failing(error: PipelineError) -> Self {
        let source = Self::new();
        source.default_script.lock().unwrap().push(Err(error));
        source
    }

    /// Script one failure for `channel`.
    pub fn failing_channel(self, channel: &str, error: PipelineError) -> Self {
        self.push_response(channel, Err(error));
        self
    }

    pub fn push_page(&self, channel: &str, page: SourcePage) {
        self.push_response(channel, Ok(page));
    }

    pub fn push_response(&self, channel: &str, response: Result<SourcePage, PipelineError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(response);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }

    pub fn fetches(&self) -> Vec<(String, Option<String>)> {
        self.fetches.lock().unwrap().clone()
    }
}

impl ChannelSource for MockSource {
    async fn fetch(
        &self,
        channel: &str,
        cursor: Option<&str>,
        _limit: usize,
    ) -> Result<SourcePage, PipelineError> {
        self.fetches
            .lock()
            .unwrap()
            .push((channel.to_string(), cursor.map(str::to_string)));

        let mut scripts = self.scripts.lock().unwrap();
        if let Some(queue) = scripts.get_mut(channel)
            && !queue.is_empty()
        {
            return queue.remove(0);
        }
        drop(scripts);

        let mut default_script = self.default_script.lock().unwrap();
        if !default_script.is_empty() {
            return default_script.remove(0);
        }
        Ok(SourcePage {
            messages: Vec::new(),
            next_cursor: None,
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedExecutor
// ---------------------------------------------------------------------------

type ErrorFactory = Arc<dyn Fn() -> PipelineError + Send + Sync>;

#[derive(Clone)]
enum ExecutorBehavior {
    Succeed(serde_json::Value),
    Skip(String),
    Fail(ErrorFactory),
    /// Fail `n` times, then succeed with the payload.
    FailThenSucceed(ErrorFactory, Arc<AtomicUsize>, serde_json::Value),
}

/// Stage executor with a fixed scripted behavior, for scheduler tests.
#[derive(Clone)]
pub struct ScriptedExecutor {
    kind: StageKind,
    behavior: ExecutorBehavior,
    calls: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn always_ok(kind: StageKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            behavior: ExecutorBehavior::Succeed(payload),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always_skipping(kind: StageKind, reason: &str) -> Self {
        Self {
            kind,
            behavior: ExecutorBehavior::Skip(reason.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn always_failing<F>(kind: StageKind, error: F) -> Self
    where
        F: Fn() -> PipelineError + Send + Sync + 'static,
    {
        Self {
            kind,
            behavior: ExecutorBehavior::Fail(Arc::new(error)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_then_ok<F>(
        kind: StageKind,
        failures: usize,
        error: F,
        payload: serde_json::Value,
    ) -> Self
    where
        F: Fn() -> PipelineError + Send + Sync + 'static,
    {
        Self {
            kind,
            behavior: ExecutorBehavior::FailThenSucceed(
                Arc::new(error),
                Arc::new(AtomicUsize::new(failures)),
                payload,
            ),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total `run` invocations across clones.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl StageExecutor for ScriptedExecutor {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn skip(&self, _item: &ContentItem) -> Option<String> {
        match &self.behavior {
            ExecutorBehavior::Skip(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    async fn run(&self, _item: &ContentItem) -> Result<StageOutput, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            ExecutorBehavior::Succeed(payload) => Ok(StageOutput::new(payload.clone())),
            ExecutorBehavior::Skip(reason) => {
                Err(PipelineError::InvalidInput(format!("skipped stage ran: {reason}")))
            }
            ExecutorBehavior::Fail(error) => Err(error()),
            ExecutorBehavior::FailThenSucceed(error, remaining, payload) => {
                let left = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if left {
                    Err(error())
                } else {
                    Ok(StageOutput::new(payload.clone()))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FlakySink
// ---------------------------------------------------------------------------

/// Sink wrapper that rejects the first `n` persists, then delegates to an
/// in-memory sink. Models a sink outage that later recovers.
#[derive(Clone)]
pub struct FlakySink {
    inner: MemorySink,
    failures_left: Arc<AtomicUsize>,
    persist_calls: Arc<AtomicUsize>,
}

impl FlakySink {
    pub fn failing_persists(n: usize) -> Self {
        Self {
            inner: MemorySink::new(),
            failures_left: Arc::new(AtomicUsize::new(n)),
            persist_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &MemorySink {
        &self.inner
    }

    /// Total `persist` invocations across clones, failed ones included.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

impl Sink for FlakySink {
    async fn persist(
        &self,
        item_id: Uuid,
        stage: StageKind,
        output: &StageOutput,
    ) -> Result<(), PipelineError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PipelineError::PersistError("sink unavailable".into()));
        }
        self.inner.persist(item_id, stage, output).await
    }

    async fn fetch(
        &self,
        item_id: Uuid,
        stage: StageKind,
    ) -> Result<Option<serde_json::Value>, PipelineError> {
        self.inner.fetch(item_id, stage).await
    }
}

// ---------------------------------------------------------------------------
// Inference mocks
// ---------------------------------------------------------------------------

/// Text inference mock with scripted queues per sub-step.
///
/// Defaults when a queue is exhausted: no entities, a "general"
/// classification, unresolved links, no relations.
#[derive(Clone, Default)]
pub struct MockTextModel {
    entities: Arc<Mutex<Vec<Result<Vec<Entity>, PipelineError>>>>,
    classifications: Arc<Mutex<Vec<Result<Classification, PipelineError>>>>,
    links: Arc<Mutex<Vec<Result<Option<String>, PipelineError>>>>,
    relations: Arc<Mutex<Vec<Result<Vec<Relation>, PipelineError>>>>,
}

impl MockTextModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_entities(&self, result: Result<Vec<Entity>, PipelineError>) {
        self.entities.lock().unwrap().push(result);
    }

    pub fn queue_classification(&self, result: Result<Classification, PipelineError>) {
        self.classifications.lock().unwrap().push(result);
    }

    pub fn queue_link(&self, result: Result<Option<String>, PipelineError>) {
        self.links.lock().unwrap().push(result);
    }

    pub fn queue_relations(&self, result: Result<Vec<Relation>, PipelineError>) {
        self.relations.lock().unwrap().push(result);
    }
}

/// One entity covering the whole of `text`.
pub fn make_entity(label: &str, text: &str) -> Entity {
    Entity {
        label: label.to_string(),
        text: text.to_string(),
        span: (0, text.len()),
        confidence: 0.9,
    }
}

impl TextInference for MockTextModel {
    fn infer_entities(&self, _text: &str) -> Result<Vec<Entity>, PipelineError> {
        let mut queue = self.entities.lock().unwrap();
        if queue.is_empty() {
            Ok(Vec::new())
        } else {
            queue.remove(0)
        }
    }

    fn classify(&self, _text: &str) -> Result<Classification, PipelineError> {
        let mut queue = self.classifications.lock().unwrap();
        if queue.is_empty() {
            Ok(Classification {
                category: "general".to_string(),
                confidence: 0.5,
            })
        } else {
            queue.remove(0)
        }
    }

    fn link(&self, _entity_text: &str) -> Result<Option<String>, PipelineError> {
        let mut queue = self.links.lock().unwrap();
        if queue.is_empty() {
            Ok(None)
        } else {
            queue.remove(0)
        }
    }

    fn relate(&self, _entities: &[Entity]) -> Result<Vec<Relation>, PipelineError> {
        let mut queue = self.relations.lock().unwrap();
        if queue.is_empty() {
            Ok(Vec::new())
        } else {
            queue.remove(0)
        }
    }
}

/// Image inference mock with a scripted queue of detection results.
#[derive(Clone, Default)]
pub struct MockImageModel {
    detections: Arc<Mutex<Vec<Result<Vec<Detection>, PipelineError>>>>,
    /// Confidence thresholds received, for assertions.
    thresholds: Arc<Mutex<Vec<f32>>>,
}

impl MockImageModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_detections(&self, result: Result<Vec<Detection>, PipelineError>) {
        self.detections.lock().unwrap().push(result);
    }

    pub fn thresholds(&self) -> Vec<f32> {
        self.thresholds.lock().unwrap().clone()
    }
}

/// A detection with a unit bounding box.
pub fn make_detection(label: &str, score: f32) -> Detection {
    Detection {
        bbox: [0.0, 0.0, 1.0, 1.0],
        label: label.to_string(),
        score,
    }
}

impl ImageInference for MockImageModel {
    fn detect(&self, _media: &MediaRef, threshold: f32) -> Result<Vec<Detection>, PipelineError> {
        self.thresholds.lock().unwrap().push(threshold);
        let mut queue = self.detections.lock().unwrap();
        if queue.is_empty() {
            Ok(Vec::new())
        } else {
            queue.remove(0)
        }
    }
}

/// Model loader that clones a preloaded model and counts loads.
#[derive(Clone)]
pub struct StaticLoader<M> {
    model: M,
    loads: Arc<AtomicUsize>,
}

impl<M> StaticLoader<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new(model: M) -> Self {
        Self {
            model,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl<M> ModelLoader for StaticLoader<M>
where
    M: Clone + Send + Sync + 'static,
{
    type Model = M;

    async fn load(&self, _resource_id: &str) -> Result<M, PipelineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.model.clone())
    }
}
