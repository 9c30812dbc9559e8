use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use argus_core::item::{ItemStatus, RawMessage, StageKind, StagePlan};
use argus_core::model_cache::{ModelCache, ModelLoader};
use argus_core::rate_limit::TokenBucket;
use argus_core::scheduler::{IngestConfig, IngestRunner, StageRunner, StageRunnerConfig};
use argus_core::sink::{MemorySink, Sink};
use argus_core::tracker::ItemTracker;
use argus_core::traits::{
    ChannelSource, Classification, Detection, Entity, ImageInference, Relation, SourcePage,
    TextInference,
};
use argus_core::{PipelineConfig, PipelineError};
use argus_stages::{
    AggregationExecutor, ExtractionExecutor, ImageEnrichmentExecutor, TextEnrichmentExecutor,
};

#[derive(Parser)]
#[command(name = "argus", version, about = "Staged content enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline over a JSONL file of raw messages
    Run {
        /// Input file, one raw message JSON object per line
        #[arg(short, long, env = "ARGUS_INPUT")]
        input: PathBuf,

        /// Channels to ingest (defaults to every channel present in the input)
        #[arg(short, long)]
        channel: Vec<String>,

        /// Print every persisted stage payload, not just the summaries
        #[arg(long, default_value_t = false)]
        verbose_outputs: bool,
    },

    /// Show the stage plan and its retry policy
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("argus=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            channel,
            verbose_outputs,
        } => cmd_run(&input, channel, verbose_outputs).await?,
        Commands::Plan => cmd_plan()?,
    }

    Ok(())
}

async fn cmd_run(input: &Path, channels: Vec<String>, verbose_outputs: bool) -> Result<()> {
    let config = PipelineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let source = FileSource::load(input)?;
    let channels = if channels.is_empty() {
        source.channels()
    } else {
        channels
    };
    if channels.is_empty() {
        anyhow::bail!("Input contains no messages");
    }

    let tracker = ItemTracker::new(StagePlan::standard(
        config.max_retries,
        config.backoff_policy(),
    ));
    let sink = MemorySink::new();
    let limiter = TokenBucket::new(config.rate_capacity, config.rate_refill_per_sec);

    tracing::info!(input = %input.display(), channels = channels.len(), "Ingesting");
    let ingest = IngestRunner::new(
        source,
        tracker.clone(),
        limiter,
        IngestConfig::from_pipeline(&config, channels),
    );
    while ingest.run_once().await.map_err(|e| anyhow::anyhow!(e))? > 0 {}
    tracing::info!(items = tracker.len(), "Ingestion complete");

    let text_cache = ModelCache::new(TextModelLoader, config.model_idle_ttl);
    let image_cache = ModelCache::new(ImageModelLoader, config.model_idle_ttl);

    let extraction = StageRunner::new(
        tracker.clone(),
        ExtractionExecutor::new(),
        sink.clone(),
        StageRunnerConfig::from_pipeline(&config, StageKind::Extraction),
    );
    let text = StageRunner::new(
        tracker.clone(),
        TextEnrichmentExecutor::new(text_cache, "lexicon-v1"),
        sink.clone(),
        StageRunnerConfig::from_pipeline(&config, StageKind::TextEnrichment),
    );
    let image = StageRunner::new(
        tracker.clone(),
        ImageEnrichmentExecutor::new(image_cache, "detector-v1", config.detection_threshold),
        sink.clone(),
        StageRunnerConfig::from_pipeline(&config, StageKind::ImageEnrichment),
    );
    let aggregation = StageRunner::new(
        tracker.clone(),
        AggregationExecutor::new(sink.clone()),
        sink.clone(),
        StageRunnerConfig::from_pipeline(&config, StageKind::Aggregation),
    );

    // Drain in dependency order until every item is terminal; a pass may
    // leave retries scheduled behind their backoff.
    loop {
        extraction.drain().await;
        tokio::join!(text.drain(), image.drain());
        aggregation.drain().await;

        let in_flight = tracker
            .items()
            .iter()
            .filter(|item| item.status() == ItemStatus::InFlight)
            .count();
        if in_flight == 0 {
            break;
        }
        tracing::info!(%in_flight, "Waiting on scheduled retries");
        tokio::time::sleep(config.poll_interval.max(Duration::from_millis(100))).await;
    }

    report(&tracker, &sink, verbose_outputs).await
}

async fn report(tracker: &ItemTracker, sink: &MemorySink, verbose_outputs: bool) -> Result<()> {
    let items = tracker.items();
    let mut done = 0usize;
    let mut failed = 0usize;

    for item in &items {
        match item.status() {
            ItemStatus::Done => done += 1,
            ItemStatus::Failed => failed += 1,
            ItemStatus::InFlight => {}
        }

        println!("# {} [{}] {}", item.source_key, status_label(item), item.id);
        if verbose_outputs {
            for stage in StageKind::ALL {
                if let Some(payload) = sink
                    .fetch(item.id, stage)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?
                {
                    println!("## {stage}\n{}", serde_json::to_string_pretty(&payload)?);
                }
            }
        } else if let Some(summary) = sink
            .fetch(item.id, StageKind::Aggregation)
            .await
            .map_err(|e| anyhow::anyhow!(e))?
        {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        for (stage, state) in &item.stages {
            if let Some(error) = &state.last_error {
                eprintln!("  {stage}: {error} (attempts: {})", state.attempts);
            }
        }
    }

    println!("\nTotal: {} items ({done} done, {failed} failed)", items.len());
    Ok(())
}

fn cmd_plan() -> Result<()> {
    let config = PipelineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let plan = StagePlan::standard(config.max_retries, config.backoff_policy());

    println!("Stage plan (max retries: {}):", config.max_retries);
    for def in plan.stages() {
        let deps = if def.depends_on.is_empty() {
            "-".to_string()
        } else {
            def.depends_on
                .iter()
                .map(|d| d.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("  {:<18} depends on: {}", def.kind.as_str(), deps);
    }
    Ok(())
}

fn status_label(item: &argus_core::item::ContentItem) -> &'static str {
    match item.status() {
        ItemStatus::Done => "done",
        ItemStatus::Failed => "FAILED",
        ItemStatus::InFlight => "in-flight",
    }
}

// ---------------------------------------------------------------------------
// File-backed channel source
// ---------------------------------------------------------------------------

/// Serves raw messages from a JSONL file, paged per channel. The fetch
/// cursor is the offset into the channel's message list.
#[derive(Clone)]
struct FileSource {
    by_channel: Arc<HashMap<String, Vec<RawMessage>>>,
}

impl FileSource {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?;
        let mut by_channel: HashMap<String, Vec<RawMessage>> = HashMap::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let message: RawMessage = serde_json::from_str(line)
                .with_context(|| format!("Invalid message on line {}", lineno + 1))?;
            by_channel
                .entry(message.channel.clone())
                .or_default()
                .push(message);
        }
        Ok(Self {
            by_channel: Arc::new(by_channel),
        })
    }

    fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.by_channel.keys().cloned().collect();
        channels.sort();
        channels
    }
}

impl ChannelSource for FileSource {
    async fn fetch(
        &self,
        channel: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<SourcePage, PipelineError> {
        let messages = self.by_channel.get(channel).map(Vec::as_slice).unwrap_or(&[]);
        let offset: usize = match cursor {
            None => 0,
            Some(c) => c
                .parse()
                .map_err(|_| PipelineError::SourceError(format!("Bad cursor '{c}'")))?,
        };
        let end = (offset + limit.max(1)).min(messages.len());
        let page = messages.get(offset..end).unwrap_or(&[]).to_vec();
        let next_cursor = (end < messages.len()).then(|| end.to_string());
        Ok(SourcePage {
            messages: page,
            next_cursor,
        })
    }
}

// ---------------------------------------------------------------------------
// Demo inference collaborators
// ---------------------------------------------------------------------------

const LEXICON: &[(&str, &str)] = &[
    ("amoxicillin", "DRUG"),
    ("ibuprofen", "DRUG"),
    ("tramadol", "DRUG"),
    ("diazepam", "DRUG"),
    ("500mg", "DOSE"),
    ("200mg", "DOSE"),
    ("50mg", "DOSE"),
    ("moscow", "LOC"),
    ("berlin", "LOC"),
    ("lagos", "LOC"),
];

const KB_LINKS: &[(&str, &str)] = &[
    ("amoxicillin", "KB:Q58396"),
    ("ibuprofen", "KB:Q186969"),
    ("tramadol", "KB:Q407308"),
    ("diazepam", "KB:Q210402"),
];

const DETECTOR_LABELS: &[&str] = &["blister", "bottle", "syringe", "powder", "package"];

/// Keyword-lexicon text scorer. Stands in for a real model bundle while
/// exercising the full sub-chain.
#[derive(Clone)]
struct LexiconTextModel;

impl TextInference for LexiconTextModel {
    fn infer_entities(&self, text: &str) -> Result<Vec<Entity>, PipelineError> {
        let lower = text.to_lowercase();
        let mut entities = Vec::new();
        for (term, label) in LEXICON {
            for (start, matched) in lower.match_indices(term) {
                entities.push(Entity {
                    label: (*label).to_string(),
                    text: matched.to_string(),
                    span: (start, start + matched.len()),
                    confidence: 0.8,
                });
            }
        }
        entities.sort_by_key(|e| e.span.0);
        Ok(entities)
    }

    fn classify(&self, text: &str) -> Result<Classification, PipelineError> {
        let entities = self.infer_entities(text)?;
        let has_drug = entities.iter().any(|e| e.label == "DRUG");
        Ok(if has_drug {
            Classification {
                category: "pharma_offer".to_string(),
                confidence: 0.85,
            }
        } else {
            Classification {
                category: "general".to_string(),
                confidence: 0.6,
            }
        })
    }

    fn link(&self, entity_text: &str) -> Result<Option<String>, PipelineError> {
        let lower = entity_text.to_lowercase();
        Ok(KB_LINKS
            .iter()
            .find(|(term, _)| *term == lower)
            .map(|(_, kb_id)| (*kb_id).to_string()))
    }

    fn relate(&self, entities: &[Entity]) -> Result<Vec<Relation>, PipelineError> {
        // Each drug relates to every dose mentioned alongside it.
        let mut relations = Vec::new();
        for drug in entities.iter().filter(|e| e.label == "DRUG") {
            for dose in entities.iter().filter(|e| e.label == "DOSE") {
                relations.push(Relation {
                    subject: drug.text.clone(),
                    predicate: "has_dose".to_string(),
                    object: dose.text.clone(),
                });
            }
        }
        Ok(relations)
    }
}

/// Filename-keyword detector. Emits one detection per known label word in
/// the media URL path.
#[derive(Clone)]
struct KeywordDetector;

impl ImageInference for KeywordDetector {
    fn detect(
        &self,
        media: &argus_core::item::MediaRef,
        threshold: f32,
    ) -> Result<Vec<Detection>, PipelineError> {
        let path = media.url.path().to_lowercase();
        let detections = DETECTOR_LABELS
            .iter()
            .filter(|label| path.contains(*label))
            .map(|label| Detection {
                bbox: [0.0, 0.0, 1.0, 1.0],
                label: (*label).to_string(),
                score: 0.9,
            })
            .filter(|d| d.score >= threshold)
            .collect();
        Ok(detections)
    }
}

#[derive(Clone)]
struct TextModelLoader;

impl ModelLoader for TextModelLoader {
    type Model = LexiconTextModel;

    async fn load(&self, _resource_id: &str) -> Result<LexiconTextModel, PipelineError> {
        Ok(LexiconTextModel)
    }
}

#[derive(Clone)]
struct ImageModelLoader;

impl ModelLoader for ImageModelLoader {
    type Model = KeywordDetector;

    async fn load(&self, _resource_id: &str) -> Result<KeywordDetector, PipelineError> {
        Ok(KeywordDetector)
    }
}
