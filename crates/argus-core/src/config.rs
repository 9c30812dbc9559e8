use std::time::Duration;

use chrono::TimeDelta;

use crate::error::PipelineError;
use crate::item::BackoffPolicy;

/// Configuration surface consumed by the pipeline core.
///
/// Read from `ARGUS_*` environment variables; every field has a default so
/// the pipeline runs unconfigured.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker pool size per stage, in plan order. Image enrichment is
    /// typically sized to the available accelerator slots.
    pub extraction_workers: usize,
    pub text_workers: usize,
    pub image_workers: usize,
    pub aggregation_workers: usize,

    /// How many runnable items a stage runner claims per poll.
    pub batch_size: usize,
    /// Idle sleep between polls when no work is runnable.
    pub poll_interval: Duration,
    /// Deadline for a single stage attempt.
    pub stage_timeout: Duration,

    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,

    /// Token bucket bounding calls to the external content source.
    pub rate_capacity: u32,
    pub rate_refill_per_sec: f64,
    /// How long an extraction worker may block waiting for tokens.
    pub rate_acquire_timeout: Duration,

    /// Idle time after which a cached model is unloaded.
    pub model_idle_ttl: Duration,
    /// How long terminal items stay in the tracker before eviction.
    pub retention: Duration,

    /// Confidence threshold handed to the object detector.
    pub detection_threshold: f32,
    /// Page size for channel source fetches.
    pub fetch_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extraction_workers: 4,
            text_workers: 2,
            image_workers: 1,
            aggregation_workers: 2,
            batch_size: 16,
            poll_interval: Duration::from_millis(500),
            stage_timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(600),
            rate_capacity: 30,
            rate_refill_per_sec: 1.0,
            rate_acquire_timeout: Duration::from_secs(30),
            model_idle_ttl: Duration::from_secs(900),
            retention: Duration::from_secs(3600),
            detection_threshold: 0.5,
            fetch_limit: 100,
        }
    }
}

impl PipelineConfig {
    /// Read configuration from `ARGUS_*` environment variables, falling back
    /// to defaults for anything unset. Malformed values are errors, not
    /// silent fallbacks.
    pub fn from_env() -> Result<Self, PipelineError> {
        let d = Self::default();
        Ok(Self {
            extraction_workers: env_parse("ARGUS_EXTRACTION_WORKERS", d.extraction_workers)?,
            text_workers: env_parse("ARGUS_TEXT_WORKERS", d.text_workers)?,
            image_workers: env_parse("ARGUS_IMAGE_WORKERS", d.image_workers)?,
            aggregation_workers: env_parse("ARGUS_AGGREGATION_WORKERS", d.aggregation_workers)?,
            batch_size: env_parse("ARGUS_BATCH_SIZE", d.batch_size)?,
            poll_interval: env_millis("ARGUS_POLL_INTERVAL_MS", d.poll_interval)?,
            stage_timeout: env_millis("ARGUS_STAGE_TIMEOUT_MS", d.stage_timeout)?,
            max_retries: env_parse("ARGUS_MAX_RETRIES", d.max_retries)?,
            backoff_base: env_millis("ARGUS_BACKOFF_BASE_MS", d.backoff_base)?,
            backoff_multiplier: env_parse("ARGUS_BACKOFF_MULTIPLIER", d.backoff_multiplier)?,
            backoff_max: env_millis("ARGUS_BACKOFF_MAX_MS", d.backoff_max)?,
            rate_capacity: env_parse("ARGUS_RATE_CAPACITY", d.rate_capacity)?,
            rate_refill_per_sec: env_parse("ARGUS_RATE_REFILL_PER_SEC", d.rate_refill_per_sec)?,
            rate_acquire_timeout: env_millis(
                "ARGUS_RATE_ACQUIRE_TIMEOUT_MS",
                d.rate_acquire_timeout,
            )?,
            model_idle_ttl: env_millis("ARGUS_MODEL_IDLE_TTL_MS", d.model_idle_ttl)?,
            retention: env_millis("ARGUS_RETENTION_MS", d.retention)?,
            detection_threshold: env_parse("ARGUS_DETECTION_THRESHOLD", d.detection_threshold)?,
            fetch_limit: env_parse("ARGUS_FETCH_LIMIT", d.fetch_limit)?,
        })
    }

    /// Backoff policy derived from the raw duration fields.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: TimeDelta::from_std(self.backoff_base).unwrap_or(TimeDelta::seconds(2)),
            multiplier: self.backoff_multiplier,
            max_delay: TimeDelta::from_std(self.backoff_max).unwrap_or(TimeDelta::minutes(10)),
        }
    }

    /// Worker pool size for a stage, by plan order.
    pub fn workers_for(&self, stage: crate::item::StageKind) -> usize {
        use crate::item::StageKind;
        match stage {
            StageKind::Extraction => self.extraction_workers,
            StageKind::TextEnrichment => self.text_workers,
            StageKind::ImageEnrichment => self.image_workers,
            StageKind::Aggregation => self.aggregation_workers,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, PipelineError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| {
            PipelineError::ConfigError(format!("Invalid {key} '{raw}': failed to parse"))
        }),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, PipelineError> {
    let ms: u64 = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
