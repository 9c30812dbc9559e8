//! Image enrichment: object detection over each attached media reference.

use serde::{Deserialize, Serialize};
use url::Url;

use argus_core::item::{ContentItem, StageKind};
use argus_core::model_cache::{ModelCache, ModelLoader};
use argus_core::stage::{StageExecutor, StageOutput};
use argus_core::traits::{Detection, ImageInference};
use argus_core::PipelineError;

/// Detections for one media attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDetections {
    pub url: Url,
    pub detections: Vec<Detection>,
}

/// Payload persisted by image enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEnrichment {
    pub media: Vec<MediaDetections>,
    pub detection_count: usize,
}

/// Runs the detector against every media attachment of an item.
///
/// Detection failures are not partial: the detector is one resource and a
/// failing attachment means the attempt must be redone, so the first error
/// fails the stage and the retry re-runs all attachments.
pub struct ImageEnrichmentExecutor<L: ModelLoader> {
    cache: ModelCache<L>,
    resource_id: String,
    threshold: f32,
}

impl<L> ImageEnrichmentExecutor<L>
where
    L: ModelLoader,
    L::Model: ImageInference,
{
    pub fn new(cache: ModelCache<L>, resource_id: impl Into<String>, threshold: f32) -> Self {
        Self {
            cache,
            resource_id: resource_id.into(),
            threshold,
        }
    }
}

impl<L> StageExecutor for ImageEnrichmentExecutor<L>
where
    L: ModelLoader,
    L::Model: ImageInference,
{
    fn kind(&self) -> StageKind {
        StageKind::ImageEnrichment
    }

    fn skip(&self, item: &ContentItem) -> Option<String> {
        if item.media().next().is_none() {
            Some("no media attached".to_string())
        } else {
            None
        }
    }

    async fn run(&self, item: &ContentItem) -> Result<StageOutput, PipelineError> {
        let handle = self.cache.acquire(&self.resource_id).await?;
        let model = handle.model();

        let mut media = Vec::new();
        let mut detection_count = 0;
        for media_ref in item.media() {
            let detections = model.detect(media_ref, self.threshold)?;
            detection_count += detections.len();
            media.push(MediaDetections {
                url: media_ref.url.clone(),
                detections,
            });
        }

        let enrichment = ImageEnrichment {
            media,
            detection_count,
        };
        tracing::debug!(
            item_id = %item.id,
            media = enrichment.media.len(),
            detections = enrichment.detection_count,
            "Image enrichment complete"
        );
        Ok(StageOutput::new(serde_json::to_value(&enrichment)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::item::{BackoffPolicy, StagePlan};
    use argus_core::testutil::{
        MockImageModel, StaticLoader, make_detection, make_media_message, make_raw_message,
    };
    use std::time::Duration;

    fn plan() -> StagePlan {
        StagePlan::standard(3, BackoffPolicy::default())
    }

    fn executor(
        model: MockImageModel,
        threshold: f32,
    ) -> ImageEnrichmentExecutor<StaticLoader<MockImageModel>> {
        let cache = ModelCache::new(StaticLoader::new(model), Duration::from_secs(60));
        ImageEnrichmentExecutor::new(cache, "detector", threshold)
    }

    #[tokio::test]
    async fn detects_per_attachment() {
        let model = MockImageModel::new();
        model.queue_detections(Ok(vec![
            make_detection("blister_pack", 0.9),
            make_detection("pill_bottle", 0.7),
        ]));
        model.queue_detections(Ok(vec![make_detection("blister_pack", 0.6)]));

        let item = ContentItem::from_raw(&make_media_message("chan", "1", 2), &plan());
        let output = executor(model.clone(), 0.5).run(&item).await.unwrap();
        let enrichment: ImageEnrichment = serde_json::from_value(output.payload).unwrap();

        assert_eq!(enrichment.media.len(), 2);
        assert_eq!(enrichment.detection_count, 3);
        // The configured threshold reaches the detector unchanged.
        assert_eq!(model.thresholds(), vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn detector_failure_fails_the_stage() {
        let model = MockImageModel::new();
        model.queue_detections(Err(PipelineError::Inference {
            message: "cuda out of memory".into(),
            retryable: true,
        }));

        let item = ContentItem::from_raw(&make_media_message("chan", "1", 1), &plan());
        let err = executor(model, 0.5).run(&item).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn text_only_item_is_skipped() {
        let exec = executor(MockImageModel::new(), 0.5);
        let item = ContentItem::from_raw(&make_raw_message("chan", "1", "just text"), &plan());
        assert_eq!(exec.skip(&item).as_deref(), Some("no media attached"));
    }
}
