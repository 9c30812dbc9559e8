use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use crate::error::PipelineError;

/// The closed set of enrichment stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Extraction,
    TextEnrichment,
    ImageEnrichment,
    Aggregation,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Extraction => "extraction",
            StageKind::TextEnrichment => "text_enrichment",
            StageKind::ImageEnrichment => "image_enrichment",
            StageKind::Aggregation => "aggregation",
        }
    }

    pub const ALL: [StageKind; 4] = [
        StageKind::Extraction,
        StageKind::TextEnrichment,
        StageKind::ImageEnrichment,
        StageKind::Aggregation,
    ];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "extraction" => Ok(StageKind::Extraction),
            "text_enrichment" => Ok(StageKind::TextEnrichment),
            "image_enrichment" => Ok(StageKind::ImageEnrichment),
            "aggregation" => Ok(StageKind::Aggregation),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Status of one (item, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Done => "done",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "failed",
        }
    }

    /// Done and Skipped both satisfy downstream dependencies.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StageStatus::Done | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether re-running a stage for the same item is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdempotencyClass {
    /// Safe to re-run any number of times, overwriting prior output.
    Pure,
    /// Re-runs must not duplicate downstream side effects; the sink
    /// dedupes by (item, stage).
    AppendOnly,
}

/// Exponential backoff for retryable stage failures.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: TimeDelta,
    pub multiplier: f64,
    pub max_delay: TimeDelta,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: TimeDelta::seconds(2),
            multiplier: 2.0,
            max_delay: TimeDelta::minutes(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt number (1-indexed): `base * multiplier^(n-1)`,
    /// capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exp = attempt.saturating_sub(1).min(30);
        let ms = self.base.num_milliseconds() as f64 * self.multiplier.powi(exp as i32);
        let delay = TimeDelta::milliseconds(ms.min(i64::MAX as f64 / 2.0) as i64);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Static configuration of one stage. Created once at startup, immutable after.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    pub kind: StageKind,
    pub depends_on: Vec<StageKind>,
    pub idempotency: IdempotencyClass,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

/// Dependency-ordered list of stage definitions shared read-only by all
/// components.
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<StageDefinition>,
}

impl StagePlan {
    /// Build a plan, validating that every dependency names an earlier stage.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self, PipelineError> {
        let mut seen: Vec<StageKind> = Vec::with_capacity(stages.len());
        for def in &stages {
            if seen.contains(&def.kind) {
                return Err(PipelineError::ConfigError(format!(
                    "Stage '{}' defined twice",
                    def.kind
                )));
            }
            for dep in &def.depends_on {
                if !seen.contains(dep) {
                    return Err(PipelineError::ConfigError(format!(
                        "Stage '{}' depends on '{}' which is not defined earlier",
                        def.kind, dep
                    )));
                }
            }
            seen.push(def.kind);
        }
        Ok(Self { stages })
    }

    /// The standard four-stage plan: extraction feeds the two independent
    /// enrichment stages, aggregation waits on both.
    pub fn standard(max_retries: u32, backoff: BackoffPolicy) -> Self {
        let def = |kind, depends_on, idempotency| StageDefinition {
            kind,
            depends_on,
            idempotency,
            max_retries,
            backoff: backoff.clone(),
        };
        // Cannot fail: dependencies are listed in order.
        Self::new(vec![
            def(StageKind::Extraction, vec![], IdempotencyClass::Pure),
            def(
                StageKind::TextEnrichment,
                vec![StageKind::Extraction],
                IdempotencyClass::AppendOnly,
            ),
            def(
                StageKind::ImageEnrichment,
                vec![StageKind::Extraction],
                IdempotencyClass::AppendOnly,
            ),
            def(
                StageKind::Aggregation,
                vec![StageKind::TextEnrichment, StageKind::ImageEnrichment],
                IdempotencyClass::Pure,
            ),
        ])
        .expect("standard plan is dependency-ordered")
    }

    pub fn definition(&self, kind: StageKind) -> Option<&StageDefinition> {
        self.stages.iter().find(|d| d.kind == kind)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn kinds(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.iter().map(|d| d.kind)
    }
}

/// Reference to an attached media object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: Url,
    pub mime: Option<String>,
}

/// One raw payload fragment of an ingested item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Fragment {
    Text(String),
    Media(MediaRef),
}

/// One raw item as returned by the channel source collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel: String,
    pub external_id: String,
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl RawMessage {
    /// Stable key unique per source + external id, used for idempotent ingestion.
    pub fn source_key(&self) -> String {
        format!("{}:{}", self.channel, self.external_id)
    }

    pub fn fragments(&self) -> Vec<Fragment> {
        let mut out = Vec::new();
        if let Some(text) = &self.text {
            out.push(Fragment::Text(text.clone()));
        }
        out.extend(self.media.iter().cloned().map(Fragment::Media));
        out
    }
}

/// Opaque handle to a stage result. The result itself goes to the sink;
/// the tracker only ever stores this reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef(pub Uuid);

impl OutputRef {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per (item, stage) progress record.
///
/// `next_attempt_at` doubles as the retryability marker while `Failed`:
/// `Some(_)` means a retry is scheduled after backoff, `None` means the
/// failure is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub skip_reason: Option<String>,
    pub output_ref: Option<OutputRef>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl StageState {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            attempts: 0,
            last_error: None,
            skip_reason: None,
            output_ref: None,
            next_attempt_at: None,
        }
    }

    /// True when no further automatic transition will occur.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            StageStatus::Done | StageStatus::Skipped => true,
            StageStatus::Failed => self.next_attempt_at.is_none(),
            StageStatus::Pending | StageStatus::Running => false,
        }
    }

    /// True when the stage is Failed but still has a retry scheduled.
    pub fn is_retryable_failure(&self) -> bool {
        self.status == StageStatus::Failed && self.next_attempt_at.is_some()
    }
}

/// Whole-item progress derived from the per-stage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    InFlight,
    Done,
    Failed,
}

/// The unit of work tracked through the pipeline.
///
/// Owned exclusively by the item tracker from creation to eviction;
/// stage executors only ever see cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    pub source_key: String,
    pub channel: String,
    pub fragments: Vec<Fragment>,
    pub created_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub stages: HashMap<StageKind, StageState>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    pub fn from_raw(raw: &RawMessage, plan: &StagePlan) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_key: raw.source_key(),
            channel: raw.channel.clone(),
            fragments: raw.fragments(),
            created_at: Utc::now(),
            posted_at: raw.posted_at,
            stages: plan
                .kinds()
                .map(|kind| (kind, StageState::pending()))
                .collect(),
            finished_at: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Text(t) => Some(t.as_str()),
            Fragment::Media(_) => None,
        })
    }

    pub fn media(&self) -> impl Iterator<Item = &MediaRef> {
        self.fragments.iter().filter_map(|f| match f {
            Fragment::Media(m) => Some(m),
            Fragment::Text(_) => None,
        })
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageState> {
        self.stages.get(&kind)
    }

    /// Derive the whole-item state: Failed once any stage terminally failed,
    /// Done once every stage is Done or Skipped, in-flight otherwise.
    pub fn status(&self) -> ItemStatus {
        let mut all_satisfied = true;
        for state in self.stages.values() {
            if state.status == StageStatus::Failed && state.is_terminal() {
                return ItemStatus::Failed;
            }
            if !state.status.satisfies_dependency() {
                all_satisfied = false;
            }
        }
        if all_satisfied {
            ItemStatus::Done
        } else {
            ItemStatus::InFlight
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
///
/// Used for content change detection on normalized extraction output.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_roundtrip() {
        for kind in StageKind::ALL {
            let parsed: StageKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = BackoffPolicy {
            base: TimeDelta::seconds(2),
            multiplier: 2.0,
            max_delay: TimeDelta::seconds(30),
        };
        assert_eq!(policy.delay_for_attempt(1), TimeDelta::seconds(2));
        assert_eq!(policy.delay_for_attempt(2), TimeDelta::seconds(4));
        assert_eq!(policy.delay_for_attempt(3), TimeDelta::seconds(8));
        // Capped.
        assert_eq!(policy.delay_for_attempt(10), TimeDelta::seconds(30));
    }

    #[test]
    fn test_standard_plan_order() {
        let plan = StagePlan::standard(3, BackoffPolicy::default());
        let kinds: Vec<_> = plan.kinds().collect();
        assert_eq!(kinds[0], StageKind::Extraction);
        assert_eq!(kinds[3], StageKind::Aggregation);

        let agg = plan.definition(StageKind::Aggregation).unwrap();
        assert_eq!(
            agg.depends_on,
            vec![StageKind::TextEnrichment, StageKind::ImageEnrichment]
        );
    }

    #[test]
    fn test_plan_rejects_forward_dependency() {
        let backoff = BackoffPolicy::default();
        let result = StagePlan::new(vec![StageDefinition {
            kind: StageKind::Aggregation,
            depends_on: vec![StageKind::TextEnrichment],
            idempotency: IdempotencyClass::Pure,
            max_retries: 3,
            backoff,
        }]);
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }

    #[test]
    fn test_stage_state_terminality() {
        let mut state = StageState::pending();
        assert!(!state.is_terminal());

        state.status = StageStatus::Failed;
        state.next_attempt_at = Some(Utc::now());
        assert!(!state.is_terminal());
        assert!(state.is_retryable_failure());

        state.next_attempt_at = None;
        assert!(state.is_terminal());
        assert!(!state.is_retryable_failure());
    }

    #[test]
    fn test_item_status_derivation() {
        let plan = StagePlan::standard(3, BackoffPolicy::default());
        let raw = RawMessage {
            channel: "medsupply".into(),
            external_id: "42".into(),
            text: Some("tablets in stock".into()),
            media: vec![],
            posted_at: None,
        };
        let mut item = ContentItem::from_raw(&raw, &plan);
        assert_eq!(item.status(), ItemStatus::InFlight);

        for kind in StageKind::ALL {
            let state = item.stages.get_mut(&kind).unwrap();
            state.status = StageStatus::Done;
        }
        assert_eq!(item.status(), ItemStatus::Done);

        let state = item.stages.get_mut(&StageKind::TextEnrichment).unwrap();
        state.status = StageStatus::Failed;
        state.next_attempt_at = None;
        assert_eq!(item.status(), ItemStatus::Failed);
    }

    #[test]
    fn test_skipped_satisfies_item_done() {
        let plan = StagePlan::standard(3, BackoffPolicy::default());
        let raw = RawMessage {
            channel: "medsupply".into(),
            external_id: "7".into(),
            text: Some("text only".into()),
            media: vec![],
            posted_at: None,
        };
        let mut item = ContentItem::from_raw(&raw, &plan);
        for kind in StageKind::ALL {
            let state = item.stages.get_mut(&kind).unwrap();
            state.status = if kind == StageKind::ImageEnrichment {
                StageStatus::Skipped
            } else {
                StageStatus::Done
            };
        }
        assert_eq!(item.status(), ItemStatus::Done);
    }

    #[test]
    fn test_raw_message_fragments_order() {
        let raw = RawMessage {
            channel: "c".into(),
            external_id: "1".into(),
            text: Some("hello".into()),
            media: vec![MediaRef {
                url: "https://cdn.example.com/a.jpg".parse().unwrap(),
                mime: Some("image/jpeg".into()),
            }],
            posted_at: None,
        };
        let fragments = raw.fragments();
        assert_eq!(fragments.len(), 2);
        assert!(matches!(fragments[0], Fragment::Text(_)));
        assert!(matches!(fragments[1], Fragment::Media(_)));
        assert_eq!(raw.source_key(), "c:1");
    }

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("a"), compute_hash("b"));
    }
}
