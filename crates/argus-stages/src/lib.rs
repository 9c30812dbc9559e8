pub mod aggregate;
pub mod extract;
pub mod image;
pub mod text;

pub use aggregate::{AggregationExecutor, ItemSummary};
pub use extract::{ExtractedContent, ExtractionExecutor, normalize_text};
pub use image::{ImageEnrichment, ImageEnrichmentExecutor, MediaDetections};
pub use text::{StepOutcome, StepReport, TextEnrichment, TextEnrichmentExecutor};
