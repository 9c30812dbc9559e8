//! Aggregation: fold the enrichment outputs into one summary record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use argus_core::item::{ContentItem, StageKind, StageStatus};
use argus_core::sink::Sink;
use argus_core::stage::{StageExecutor, StageOutput};
use argus_core::PipelineError;

use crate::image::ImageEnrichment;
use crate::text::TextEnrichment;

/// The final per-item summary.
///
/// `missing_inputs` names enrichment stages that produced no output for this
/// item, either because they were skipped or failed terminally; the summary
/// is still produced from whatever is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub channel: String,
    pub category: Option<String>,
    pub entity_count: usize,
    pub entities_by_label: BTreeMap<String, usize>,
    pub linked_count: usize,
    pub relation_count: usize,
    pub detection_count: usize,
    pub detections_by_label: BTreeMap<String, usize>,
    pub missing_inputs: Vec<String>,
}

/// Builds the summary by reading upstream outputs back from the sink.
#[derive(Clone)]
pub struct AggregationExecutor<S: Sink> {
    sink: S,
}

impl<S: Sink> AggregationExecutor<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: Sink> StageExecutor for AggregationExecutor<S> {
    fn kind(&self) -> StageKind {
        StageKind::Aggregation
    }

    async fn run(&self, item: &ContentItem) -> Result<StageOutput, PipelineError> {
        let mut summary = ItemSummary {
            channel: item.channel.clone(),
            category: None,
            entity_count: 0,
            entities_by_label: BTreeMap::new(),
            linked_count: 0,
            relation_count: 0,
            detection_count: 0,
            detections_by_label: BTreeMap::new(),
            missing_inputs: Vec::new(),
        };

        match self.sink.fetch(item.id, StageKind::TextEnrichment).await? {
            Some(payload) => {
                let text: TextEnrichment = serde_json::from_value(payload)?;
                summary.entity_count = text.entities.len();
                for entity in &text.entities {
                    *summary
                        .entities_by_label
                        .entry(entity.label.clone())
                        .or_insert(0) += 1;
                }
                summary.category = text.classification.map(|c| c.category);
                summary.linked_count = text.linked.len();
                summary.relation_count = text.relations.len();
            }
            None => summary
                .missing_inputs
                .push(StageKind::TextEnrichment.to_string()),
        }

        match self.sink.fetch(item.id, StageKind::ImageEnrichment).await? {
            Some(payload) => {
                let image: ImageEnrichment = serde_json::from_value(payload)?;
                summary.detection_count = image.detection_count;
                for media in &image.media {
                    for detection in &media.detections {
                        *summary
                            .detections_by_label
                            .entry(detection.label.clone())
                            .or_insert(0) += 1;
                    }
                }
            }
            None => summary
                .missing_inputs
                .push(StageKind::ImageEnrichment.to_string()),
        }

        // A dependency that is Done must have a readable output; its absence
        // from the sink is an inconsistency worth retrying, not papering over.
        for stage in [StageKind::TextEnrichment, StageKind::ImageEnrichment] {
            let done = item.stage(stage).is_some_and(|s| s.status == StageStatus::Done);
            if done && summary.missing_inputs.contains(&stage.to_string()) {
                return Err(PipelineError::PersistError(format!(
                    "missing {stage} output for item {}",
                    item.id
                )));
            }
        }

        tracing::debug!(
            item_id = %item.id,
            entities = summary.entity_count,
            detections = summary.detection_count,
            missing = ?summary.missing_inputs,
            "Aggregation complete"
        );
        Ok(StageOutput::new(serde_json::to_value(&summary)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MediaDetections;
    use crate::text::{StepOutcome, StepReport};
    use argus_core::item::{BackoffPolicy, StagePlan};
    use argus_core::sink::MemorySink;
    use argus_core::testutil::{make_detection, make_entity, make_raw_message};
    use argus_core::traits::Classification;

    fn item_with_stage_status(statuses: &[(StageKind, StageStatus)]) -> ContentItem {
        let mut item = ContentItem::from_raw(
            &make_raw_message("pharma_deals", "1", "amoxicillin 500mg"),
            &StagePlan::standard(3, BackoffPolicy::default()),
        );
        for (kind, status) in statuses {
            item.stages.get_mut(kind).unwrap().status = *status;
        }
        item
    }

    fn text_payload() -> serde_json::Value {
        serde_json::to_value(TextEnrichment {
            entities: vec![
                make_entity("DRUG", "amoxicillin"),
                make_entity("DRUG", "ibuprofen"),
                make_entity("DOSE", "500mg"),
            ],
            classification: Some(Classification {
                category: "pharma_offer".into(),
                confidence: 0.9,
            }),
            linked: vec![],
            relations: vec![],
            steps: StepReport {
                ner: StepOutcome::Ok,
                classification: StepOutcome::Ok,
                linking: StepOutcome::Ok,
                relations: StepOutcome::Skipped("no entities".into()),
            },
        })
        .unwrap()
    }

    fn image_payload() -> serde_json::Value {
        serde_json::to_value(ImageEnrichment {
            media: vec![MediaDetections {
                url: "https://cdn.example.com/a.jpg".parse().unwrap(),
                detections: vec![
                    make_detection("blister_pack", 0.8),
                    make_detection("blister_pack", 0.7),
                ],
            }],
            detection_count: 2,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn summarizes_both_enrichments() {
        let sink = MemorySink::new();
        let item = item_with_stage_status(&[
            (StageKind::TextEnrichment, StageStatus::Done),
            (StageKind::ImageEnrichment, StageStatus::Done),
        ]);
        sink.persist(
            item.id,
            StageKind::TextEnrichment,
            &StageOutput::new(text_payload()),
        )
        .await
        .unwrap();
        sink.persist(
            item.id,
            StageKind::ImageEnrichment,
            &StageOutput::new(image_payload()),
        )
        .await
        .unwrap();

        let output = AggregationExecutor::new(sink).run(&item).await.unwrap();
        let summary: ItemSummary = serde_json::from_value(output.payload).unwrap();

        assert_eq!(summary.channel, "pharma_deals");
        assert_eq!(summary.category.as_deref(), Some("pharma_offer"));
        assert_eq!(summary.entity_count, 3);
        assert_eq!(summary.entities_by_label.get("DRUG"), Some(&2));
        assert_eq!(summary.detection_count, 2);
        assert_eq!(summary.detections_by_label.get("blister_pack"), Some(&2));
        assert!(summary.missing_inputs.is_empty());
    }

    #[tokio::test]
    async fn skipped_inputs_are_noted_not_fatal() {
        let sink = MemorySink::new();
        let item = item_with_stage_status(&[
            (StageKind::TextEnrichment, StageStatus::Skipped),
            (StageKind::ImageEnrichment, StageStatus::Skipped),
        ]);

        let output = AggregationExecutor::new(sink).run(&item).await.unwrap();
        let summary: ItemSummary = serde_json::from_value(output.payload).unwrap();

        assert_eq!(summary.entity_count, 0);
        assert_eq!(
            summary.missing_inputs,
            vec!["text_enrichment".to_string(), "image_enrichment".to_string()]
        );
    }

    #[tokio::test]
    async fn done_stage_with_missing_output_is_an_error() {
        let sink = MemorySink::new();
        let item = item_with_stage_status(&[(StageKind::TextEnrichment, StageStatus::Done)]);

        let err = AggregationExecutor::new(sink).run(&item).await.unwrap_err();
        assert!(matches!(err, PipelineError::PersistError(_)));
        assert!(err.is_retryable());
    }
}
