use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::PipelineError;
use crate::item::{OutputRef, StageKind};
use crate::stage::StageOutput;

/// Persists stage outputs for downstream consumption.
///
/// The scheduler may call `persist` more than once for the same logical
/// result under retry, so implementations must dedupe by (item, stage):
/// a repeated write carrying the same output reference is a no-op.
pub trait Sink: Send + Sync + Clone {
    fn persist(
        &self,
        item_id: Uuid,
        stage: StageKind,
        output: &StageOutput,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;

    /// Read side: the persisted payload for (item, stage), if any.
    /// Consumed by aggregation and by tests.
    fn fetch(
        &self,
        item_id: Uuid,
        stage: StageKind,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, PipelineError>> + Send;
}

#[derive(Default)]
struct MemorySinkInner {
    entries: HashMap<(Uuid, StageKind), (OutputRef, serde_json::Value)>,
    /// Count of logical (non-deduped) writes per key, for test assertions.
    writes: HashMap<(Uuid, StageKind), usize>,
}

/// In-memory sink. Cloning shares the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MemorySinkInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned sink mutex");
            poisoned.into_inner()
        })
    }

    /// Logical writes recorded for (item, stage); duplicate persists of the
    /// same output reference do not count.
    pub fn write_count(&self, item_id: Uuid, stage: StageKind) -> usize {
        self.lock_inner()
            .writes
            .get(&(item_id, stage))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.lock_inner().writes.values().sum()
    }
}

impl Sink for MemorySink {
    async fn persist(
        &self,
        item_id: Uuid,
        stage: StageKind,
        output: &StageOutput,
    ) -> Result<(), PipelineError> {
        let mut inner = self.lock_inner();
        let key = (item_id, stage);
        if let Some((existing_ref, _)) = inner.entries.get(&key)
            && *existing_ref == output.reference
        {
            tracing::debug!(%item_id, %stage, reference = %output.reference, "Duplicate persist deduped");
            return Ok(());
        }
        inner
            .entries
            .insert(key, (output.reference, output.payload.clone()));
        *inner.writes.entry(key).or_insert(0) += 1;
        Ok(())
    }

    async fn fetch(
        &self,
        item_id: Uuid,
        stage: StageKind,
    ) -> Result<Option<serde_json::Value>, PipelineError> {
        Ok(self
            .lock_inner()
            .entries
            .get(&(item_id, stage))
            .map(|(_, payload)| payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn persist_and_fetch_roundtrip() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();
        let output = StageOutput::new(json!({"entities": []}));

        sink.persist(id, StageKind::TextEnrichment, &output)
            .await
            .unwrap();
        let fetched = sink.fetch(id, StageKind::TextEnrichment).await.unwrap();
        assert_eq!(fetched, Some(json!({"entities": []})));
        assert!(
            sink.fetch(id, StageKind::ImageEnrichment)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn same_reference_is_deduped() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();
        let output = StageOutput::new(json!({"a": 1}));

        sink.persist(id, StageKind::TextEnrichment, &output)
            .await
            .unwrap();
        sink.persist(id, StageKind::TextEnrichment, &output)
            .await
            .unwrap();
        assert_eq!(sink.write_count(id, StageKind::TextEnrichment), 1);
    }

    #[tokio::test]
    async fn new_reference_overwrites() {
        let sink = MemorySink::new();
        let id = Uuid::new_v4();

        sink.persist(id, StageKind::Aggregation, &StageOutput::new(json!({"v": 1})))
            .await
            .unwrap();
        sink.persist(id, StageKind::Aggregation, &StageOutput::new(json!({"v": 2})))
            .await
            .unwrap();

        assert_eq!(sink.write_count(id, StageKind::Aggregation), 2);
        let fetched = sink.fetch(id, StageKind::Aggregation).await.unwrap();
        assert_eq!(fetched, Some(json!({"v": 2})));
    }
}
