//! Extraction: normalize a raw item's payload into clean, hashable content.

use serde::{Deserialize, Serialize};

use argus_core::item::{ContentItem, MediaRef, StageKind, compute_hash};
use argus_core::stage::{StageExecutor, StageOutput};
use argus_core::PipelineError;

/// Normalized payload produced by extraction and consumed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    /// SHA-256 of the normalized text, for change detection. Absent for
    /// media-only items.
    pub content_hash: Option<String>,
    pub fragment_count: usize,
}

/// Cleans raw message text and validates that the item carries something
/// the enrichment stages can work with.
#[derive(Debug, Clone, Default)]
pub struct ExtractionExecutor;

impl ExtractionExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl StageExecutor for ExtractionExecutor {
    fn kind(&self) -> StageKind {
        StageKind::Extraction
    }

    async fn run(&self, item: &ContentItem) -> Result<StageOutput, PipelineError> {
        let text = item.text().map(normalize_text).filter(|t| !t.is_empty());
        let media: Vec<MediaRef> = item.media().cloned().collect();

        if text.is_none() && media.is_empty() {
            return Err(PipelineError::UnsupportedContent(
                "no text or media after normalization".to_string(),
            ));
        }

        let content_hash = text.as_deref().map(compute_hash);
        let extracted = ExtractedContent {
            fragment_count: item.fragments.len(),
            text,
            media,
            content_hash,
        };
        tracing::debug!(
            item_id = %item.id,
            has_text = extracted.text.is_some(),
            media = extracted.media.len(),
            "Extraction normalized item"
        );
        Ok(StageOutput::new(serde_json::to_value(&extracted)?))
    }
}

/// Collapse runs of spaces and tabs, drop control characters, and cap
/// consecutive blank lines at one.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    for line in raw.lines() {
        let cleaned: Vec<&str> = line
            .split([' ', '\t'])
            .filter(|w| !w.is_empty())
            .collect();
        let cleaned = cleaned.join(" ");
        let cleaned: String = cleaned.chars().filter(|c| !c.is_control()).collect();

        if cleaned.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&cleaned);
    }
    out.trim_matches('\n').to_string()
}
