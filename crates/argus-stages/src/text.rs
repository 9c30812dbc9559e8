//! Text enrichment: the NER → classification → linking → relation sub-chain.
//!
//! Partial results are first-class. Entity recognition anchors the chain, so
//! its failure fails the whole stage; any later sub-step failure is recorded
//! in the payload and the stage still completes with what it has.

use serde::{Deserialize, Serialize};

use argus_core::item::{ContentItem, StageKind};
use argus_core::model_cache::{ModelCache, ModelLoader};
use argus_core::stage::{StageExecutor, StageOutput};
use argus_core::traits::{Classification, Entity, LinkedEntity, Relation, TextInference};
use argus_core::PipelineError;

/// Outcome of one sub-step, kept in the payload for downstream visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum StepOutcome {
    Ok,
    Failed(String),
    Skipped(String),
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub ner: StepOutcome,
    pub classification: StepOutcome,
    pub linking: StepOutcome,
    pub relations: StepOutcome,
}

/// Payload persisted by text enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextEnrichment {
    pub entities: Vec<Entity>,
    pub classification: Option<Classification>,
    pub linked: Vec<LinkedEntity>,
    pub relations: Vec<Relation>,
    pub steps: StepReport,
}

/// Runs the text sub-chain against a cached inference bundle.
pub struct TextEnrichmentExecutor<L: ModelLoader> {
    cache: ModelCache<L>,
    resource_id: String,
}

impl<L> TextEnrichmentExecutor<L>
where
    L: ModelLoader,
    L::Model: TextInference,
{
    pub fn new(cache: ModelCache<L>, resource_id: impl Into<String>) -> Self {
        Self {
            cache,
            resource_id: resource_id.into(),
        }
    }
}

impl<L> StageExecutor for TextEnrichmentExecutor<L>
where
    L: ModelLoader,
    L::Model: TextInference,
{
    fn kind(&self) -> StageKind {
        StageKind::TextEnrichment
    }

    fn skip(&self, item: &ContentItem) -> Option<String> {
        match item.text() {
            Some(t) if !t.trim().is_empty() => None,
            _ => Some("no text content".to_string()),
        }
    }

    async fn run(&self, item: &ContentItem) -> Result<StageOutput, PipelineError> {
        let text = item
            .text()
            .ok_or_else(|| PipelineError::InvalidInput("item has no text".to_string()))?;
        let handle = self.cache.acquire(&self.resource_id).await?;
        let model = handle.model();

        // Entity recognition anchors everything downstream.
        let entities = model.infer_entities(text)?;

        let (classification, classification_step) = match model.classify(text) {
            Ok(c) => (Some(c), StepOutcome::Ok),
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "Classification failed, continuing");
                (None, StepOutcome::Failed(e.to_string()))
            }
        };

        let mut linked = Vec::new();
        let mut linking_step = StepOutcome::Ok;
        for entity in &entities {
            match model.link(&entity.text) {
                Ok(Some(kb_id)) => linked.push(LinkedEntity {
                    text: entity.text.clone(),
                    label: entity.label.clone(),
                    kb_id,
                }),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(item_id = %item.id, error = %e, "Entity linking failed, continuing");
                    linking_step = StepOutcome::Failed(e.to_string());
                    break;
                }
            }
        }

        let (relations, relations_step) = if entities.is_empty() {
            (Vec::new(), StepOutcome::Skipped("no entities".to_string()))
        } else {
            match model.relate(&entities) {
                Ok(r) => (r, StepOutcome::Ok),
                Err(e) => {
                    tracing::warn!(item_id = %item.id, error = %e, "Relation extraction failed, continuing");
                    (Vec::new(), StepOutcome::Failed(e.to_string()))
                }
            }
        };

        let enrichment = TextEnrichment {
            entities,
            classification,
            linked,
            relations,
            steps: StepReport {
                ner: StepOutcome::Ok,
                classification: classification_step,
                linking: linking_step,
                relations: relations_step,
            },
        };
        tracing::debug!(
            item_id = %item.id,
            entities = enrichment.entities.len(),
            linked = enrichment.linked.len(),
            relations = enrichment.relations.len(),
            "Text enrichment complete"
        );
        Ok(StageOutput::new(serde_json::to_value(&enrichment)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::item::{BackoffPolicy, StagePlan};
    use argus_core::testutil::{
        MockTextModel, StaticLoader, make_entity, make_media_message, make_raw_message,
    };
    use std::time::Duration;

    fn item(text: &str) -> ContentItem {
        ContentItem::from_raw(
            &make_raw_message("chan", "1", text),
            &StagePlan::standard(3, BackoffPolicy::default()),
        )
    }

    fn executor(model: MockTextModel) -> TextEnrichmentExecutor<StaticLoader<MockTextModel>> {
        let cache = ModelCache::new(StaticLoader::new(model), Duration::from_secs(60));
        TextEnrichmentExecutor::new(cache, "text-bundle")
    }

    #[tokio::test]
    async fn full_chain_produces_all_results() {
        let model = MockTextModel::new();
        model.queue_entities(Ok(vec![
            make_entity("DRUG", "amoxicillin"),
            make_entity("DOSE", "500mg"),
        ]));
        model.queue_classification(Ok(Classification {
            category: "pharma_offer".into(),
            confidence: 0.92,
        }));
        model.queue_link(Ok(Some("KB:amox".into())));
        model.queue_link(Ok(None));
        model.queue_relations(Ok(vec![Relation {
            subject: "amoxicillin".into(),
            predicate: "has_dose".into(),
            object: "500mg".into(),
        }]));

        let output = executor(model).run(&item("amoxicillin 500mg")).await.unwrap();
        let enrichment: TextEnrichment = serde_json::from_value(output.payload).unwrap();

        assert_eq!(enrichment.entities.len(), 2);
        assert_eq!(
            enrichment.classification.unwrap().category,
            "pharma_offer"
        );
        assert_eq!(enrichment.linked.len(), 1);
        assert_eq!(enrichment.linked[0].kb_id, "KB:amox");
        assert_eq!(enrichment.relations.len(), 1);
        assert!(enrichment.steps.classification.is_ok());
    }

    #[tokio::test]
    async fn ner_failure_fails_the_stage() {
        let model = MockTextModel::new();
        model.queue_entities(Err(PipelineError::Inference {
            message: "scorer crashed".into(),
            retryable: true,
        }));

        let err = executor(model).run(&item("some text")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn later_step_failures_keep_partial_results() {
        let model = MockTextModel::new();
        model.queue_entities(Ok(vec![make_entity("DRUG", "ibuprofen")]));
        model.queue_classification(Err(PipelineError::Inference {
            message: "classifier oom".into(),
            retryable: true,
        }));
        model.queue_link(Err(PipelineError::Inference {
            message: "kb unreachable".into(),
            retryable: true,
        }));
        model.queue_relations(Err(PipelineError::Inference {
            message: "relator broken".into(),
            retryable: false,
        }));

        let output = executor(model).run(&item("ibuprofen")).await.unwrap();
        let enrichment: TextEnrichment = serde_json::from_value(output.payload).unwrap();

        // The anchor result survives; every degraded step is recorded.
        assert_eq!(enrichment.entities.len(), 1);
        assert!(enrichment.classification.is_none());
        assert!(enrichment.linked.is_empty());
        assert!(enrichment.relations.is_empty());
        assert!(matches!(enrichment.steps.ner, StepOutcome::Ok));
        assert!(matches!(enrichment.steps.classification, StepOutcome::Failed(_)));
        assert!(matches!(enrichment.steps.linking, StepOutcome::Failed(_)));
        assert!(matches!(enrichment.steps.relations, StepOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn no_entities_skips_relations() {
        let model = MockTextModel::new();
        model.queue_entities(Ok(Vec::new()));

        let output = executor(model).run(&item("nothing notable")).await.unwrap();
        let enrichment: TextEnrichment = serde_json::from_value(output.payload).unwrap();
        assert!(matches!(enrichment.steps.relations, StepOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn media_only_item_is_skipped() {
        let exec = executor(MockTextModel::new());
        let item = ContentItem::from_raw(
            &make_media_message("chan", "2", 1),
            &StagePlan::standard(3, BackoffPolicy::default()),
        );
        assert_eq!(exec.skip(&item).as_deref(), Some("no text content"));
    }

    #[tokio::test]
    async fn model_loads_once_across_items() {
        let loader = StaticLoader::new(MockTextModel::new());
        let cache = ModelCache::new(loader.clone(), Duration::from_secs(60));
        let exec = TextEnrichmentExecutor::new(cache, "text-bundle");

        exec.run(&item("first")).await.unwrap();
        exec.run(&item("second")).await.unwrap();
        assert_eq!(loader.load_count(), 1);
    }
}
