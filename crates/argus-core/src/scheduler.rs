//! The orchestration core: per-stage runner loops over the item tracker.
//!
//! Each stage gets its own runner with a bounded worker pool; runners for
//! stages with no dependency relation run concurrently, and dependency order
//! across stages is enforced per item by the tracker's runnable query, never
//! by runner scheduling. Failures local to one item never abort a runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::item::{ContentItem, StageKind};
use crate::rate_limit::TokenBucket;
use crate::sink::Sink;
use crate::stage::StageExecutor;
use crate::tracker::{FailureDisposition, ItemTracker};
use crate::traits::ChannelSource;

/// Runtime knobs for one stage runner.
#[derive(Debug, Clone)]
pub struct StageRunnerConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub stage_timeout: Duration,
}

impl StageRunnerConfig {
    pub fn from_pipeline(config: &PipelineConfig, stage: StageKind) -> Self {
        Self {
            workers: config.workers_for(stage).max(1),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            stage_timeout: config.stage_timeout,
        }
    }
}

/// Drives one stage: claims runnable items, dispatches them to a bounded
/// worker pool, and applies each outcome through the tracker's atomic
/// transitions.
pub struct StageRunner<E, S>
where
    E: StageExecutor + Send + Sync + 'static,
    S: Sink + 'static,
{
    tracker: ItemTracker,
    executor: Arc<E>,
    sink: S,
    config: StageRunnerConfig,
    sink_outage: Arc<AtomicU32>,
}

impl<E, S> StageRunner<E, S>
where
    E: StageExecutor + Send + Sync + 'static,
    S: Sink + 'static,
{
    pub fn new(tracker: ItemTracker, executor: E, sink: S, config: StageRunnerConfig) -> Self {
        Self {
            tracker,
            executor: Arc::new(executor),
            sink,
            config,
            sink_outage: Arc::new(AtomicU32::new(0)),
        }
    }

    /// How long to hold off claiming while the sink is unhealthy, if at all.
    /// Grows with consecutive persist failures; a successful persist resets it.
    fn sink_pause(&self) -> Option<Duration> {
        let outages = self.sink_outage.load(Ordering::SeqCst);
        if outages == 0 {
            return None;
        }
        Some(self.config.poll_interval * 2u32.pow(outages.min(5)))
    }

    /// Run until cancellation. In-flight invocations are drained, never
    /// force-killed; a tracker mutation is never interrupted.
    pub async fn run(&self, cancel: CancellationToken) {
        let stage = self.executor.kind();
        tracing::info!(%stage, workers = self.config.workers, "Stage runner started");

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            while tasks.try_join_next().is_some() {}

            // Sink down: pause dispatch instead of burning item retries.
            if let Some(pause) = self.sink_pause() {
                tracing::warn!(%stage, pause_ms = %pause.as_millis(), "Sink unhealthy, pausing dispatch");
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    () = cancel.cancelled() => break,
                }
                continue;
            }

            let dispatched = self.sweep(&semaphore, &mut tasks, &cancel).await;
            if !dispatched {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }

        // Graceful shutdown: let in-flight work finish.
        let in_flight = tasks.len();
        if in_flight > 0 {
            tracing::info!(%stage, %in_flight, "Draining in-flight stage invocations");
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!(%stage, "Stage runner stopped");
    }

    /// Process everything currently runnable, then return once the pool is
    /// idle. Retries scheduled behind a backoff that has not elapsed yet are
    /// left in place.
    pub async fn drain(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        loop {
            if let Some(pause) = self.sink_pause() {
                tracing::warn!(pause_ms = %pause.as_millis(), "Sink unhealthy, pausing dispatch");
                tokio::time::sleep(pause).await;
            }
            let dispatched = self.sweep(&semaphore, &mut tasks, &cancel).await;
            if dispatched {
                while tasks.join_next().await.is_some() {}
                continue;
            }
            if tasks.is_empty() {
                break;
            }
            while tasks.join_next().await.is_some() {}
        }
    }

    /// Claim and dispatch one batch. Returns true if any work was dispatched
    /// or skipped.
    async fn sweep(
        &self,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> bool {
        let stage = self.executor.kind();
        let batch = self.tracker.get_runnable(stage, self.config.batch_size);
        if batch.is_empty() {
            return false;
        }

        let mut progressed = false;
        for id in batch {
            if cancel.is_cancelled() {
                break;
            }
            let Some(item) = self.tracker.get(id) else {
                continue;
            };

            if let Some(reason) = self.executor.skip(&item) {
                match self.tracker.mark_skipped(id, stage, &reason) {
                    Ok(()) => {
                        tracing::info!(item_id = %id, %stage, %reason, "Stage skipped");
                        progressed = true;
                    }
                    Err(e) if e.is_stale_transition() => {
                        tracing::debug!(item_id = %id, %stage, "Lost skip race");
                    }
                    Err(e) => tracing::error!(item_id = %id, %stage, error = %e, "Skip failed"),
                }
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                () = cancel.cancelled() => break,
            };

            // Claim under the pool permit so a full pool never strands items
            // in Running.
            if let Err(e) = self.tracker.mark_running(id, stage) {
                if e.is_stale_transition() {
                    tracing::debug!(item_id = %id, %stage, "Another worker claimed the item");
                }
                continue;
            }
            progressed = true;

            let tracker = self.tracker.clone();
            let executor = Arc::clone(&self.executor);
            let sink = self.sink.clone();
            let sink_outage = Arc::clone(&self.sink_outage);
            let timeout = self.config.stage_timeout;
            tasks.spawn(async move {
                let _permit = permit;
                process_one(tracker, executor, sink, sink_outage, item, timeout).await;
            });
        }
        progressed
    }
}

/// Execute one claimed (item, stage) invocation and apply its outcome.
async fn process_one<E, S>(
    tracker: ItemTracker,
    executor: Arc<E>,
    sink: S,
    sink_outage: Arc<AtomicU32>,
    item: ContentItem,
    timeout: Duration,
) where
    E: StageExecutor + Send + Sync,
    S: Sink,
{
    let stage = executor.kind();
    let id = item.id;
    let attempt = tracker
        .get(id)
        .and_then(|i| i.stage(stage).map(|s| s.attempts))
        .unwrap_or(0);
    tracing::info!(item_id = %id, %stage, %attempt, "Processing item");

    let result = match tokio::time::timeout(timeout, executor.run(&item)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout(timeout.as_secs())),
    };

    match result {
        Ok(output) => {
            if let Err(e) = sink.persist(id, stage, &output).await {
                // The stage itself succeeded; the outage is the sink's, so the
                // claim is returned uncharged and dispatch pauses instead.
                let outages = sink_outage.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::warn!(item_id = %id, %stage, %outages, error = %e, "Persist failed, releasing claim");
                match tracker.release_claim(id, stage, &e) {
                    Ok(()) => {}
                    Err(err) if err.is_stale_transition() => {
                        tracing::debug!(item_id = %id, %stage, "Stale release dropped");
                    }
                    Err(err) => {
                        tracing::error!(item_id = %id, %stage, error = %err, "Release rejected");
                    }
                }
                return;
            }
            sink_outage.store(0, Ordering::SeqCst);
            match tracker.mark_done(id, stage, output.reference) {
                Ok(()) => {
                    tracing::info!(item_id = %id, %stage, reference = %output.reference, "Stage done");
                }
                Err(e) if e.is_stale_transition() => {
                    tracing::debug!(item_id = %id, %stage, "Stale completion dropped");
                }
                Err(e) => tracing::error!(item_id = %id, %stage, error = %e, "Completion failed"),
            }
        }
        Err(e) => apply_failure(&tracker, id, stage, &e),
    }
}

fn apply_failure(tracker: &ItemTracker, id: Uuid, stage: StageKind, error: &PipelineError) {
    match tracker.mark_failed(id, stage, error) {
        Ok(FailureDisposition::Retrying) => {
            tracing::warn!(item_id = %id, %stage, error = %error, "Stage failed, retry scheduled");
        }
        Ok(FailureDisposition::Terminal) => {
            tracing::error!(item_id = %id, %stage, error = %error, "Stage failed permanently");
        }
        Err(e) if e.is_stale_transition() => {
            tracing::debug!(item_id = %id, %stage, "Stale failure dropped");
        }
        Err(e) => tracing::error!(item_id = %id, %stage, error = %e, "Failure transition rejected"),
    }
}

/// Runtime knobs for the ingest runner.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub channels: Vec<String>,
    pub fetch_limit: usize,
    pub rate_acquire_timeout: Duration,
    pub poll_interval: Duration,
    pub retention: Duration,
}

impl IngestConfig {
    pub fn from_pipeline(config: &PipelineConfig, channels: Vec<String>) -> Self {
        Self {
            channels,
            fetch_limit: config.fetch_limit,
            rate_acquire_timeout: config.rate_acquire_timeout,
            poll_interval: config.poll_interval,
            retention: config.retention,
        }
    }
}

/// Pulls raw items from the external source into the tracker.
///
/// Every `fetch` is gated on the shared token bucket; a source-side
/// rate-limit signal makes the runner re-check the limiter's wait hint
/// instead of retrying immediately.
pub struct IngestRunner<C: ChannelSource> {
    source: C,
    tracker: ItemTracker,
    limiter: TokenBucket,
    config: IngestConfig,
    cursors: std::sync::Mutex<HashMap<String, Option<String>>>,
}

impl<C: ChannelSource> IngestRunner<C> {
    pub fn new(source: C, tracker: ItemTracker, limiter: TokenBucket, config: IngestConfig) -> Self {
        Self {
            source,
            tracker,
            limiter,
            config,
            cursors: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One sweep over all channels. Returns how many new items were created.
    ///
    /// Credential failures abort the sweep; everything else is contained to
    /// the affected channel.
    pub async fn run_once(&self) -> Result<usize, PipelineError> {
        let mut created = 0;
        for channel in &self.config.channels {
            match self
                .limiter
                .acquire(1, self.config.rate_acquire_timeout)
                .await
            {
                Ok(()) => {}
                Err(e @ PipelineError::RateLimitTimeout { .. }) => {
                    // Scheduling backoff, not a failure: pick the channel up
                    // again on the next sweep.
                    tracing::warn!(%channel, error = %e, "Rate limiter starved, deferring channel");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let cursor = self
                .cursors
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(channel)
                .cloned()
                .flatten();
            match self
                .source
                .fetch(channel, cursor.as_deref(), self.config.fetch_limit)
                .await
            {
                Ok(page) => {
                    let fetched = page.messages.len();
                    for raw in &page.messages {
                        let outcome = self.tracker.create(raw);
                        if outcome.is_created() {
                            created += 1;
                            tracing::debug!(
                                item_id = %outcome.id(),
                                source_key = %raw.source_key(),
                                "Item ingested"
                            );
                        }
                    }
                    tracing::info!(%channel, %fetched, %created, "Channel fetched");
                    self.cursors
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(channel.clone(), page.next_cursor);
                }
                Err(PipelineError::SourceRateLimited) => {
                    let wait = match self.limiter.try_acquire(1) {
                        Ok(Err(wait)) => wait.max(self.config.poll_interval),
                        _ => self.config.poll_interval,
                    };
                    tracing::warn!(%channel, wait_ms = %wait.as_millis(), "Source rate limited, backing off");
                    tokio::time::sleep(wait).await;
                }
                Err(e @ PipelineError::AuthError(_)) => {
                    tracing::error!(%channel, error = %e, "Source rejected credentials");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "Channel fetch failed");
                }
            }
        }
        Ok(created)
    }

    /// Run sweeps until cancellation, evicting retained terminal items
    /// between sweeps.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        tracing::info!(channels = self.config.channels.len(), "Ingest runner started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let created = self.run_once().await?;
            self.tracker.evict_finished(self.config.retention);
            if created == 0 {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }
        tracing::info!("Ingest runner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{BackoffPolicy, StagePlan};
    use crate::sink::MemorySink;
    use crate::testutil::{FlakySink, MockSource, ScriptedExecutor};
    use chrono::TimeDelta;
    use serde_json::json;

    fn test_tracker() -> ItemTracker {
        let backoff = BackoffPolicy {
            base: TimeDelta::zero(),
            multiplier: 1.0,
            max_delay: TimeDelta::zero(),
        };
        ItemTracker::new(StagePlan::standard(3, backoff))
    }

    fn runner_config(workers: usize) -> StageRunnerConfig {
        StageRunnerConfig {
            workers,
            batch_size: 8,
            poll_interval: Duration::from_millis(10),
            stage_timeout: Duration::from_secs(5),
        }
    }

    fn ingest_config(channels: Vec<String>) -> IngestConfig {
        IngestConfig {
            channels,
            fetch_limit: 50,
            rate_acquire_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            retention: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn ingest_creates_items_idempotently() {
        let tracker = test_tracker();
        let source = MockSource::with_texts("alerts", &["msg one", "msg two"]);
        source.push_page(
            "alerts",
            crate::testutil::page_of_texts("alerts", &["msg one", "msg two"]),
        );
        let runner = IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["alerts".into()]),
        );

        assert_eq!(runner.run_once().await.unwrap(), 2);
        // Second sweep serves the same page again: no duplicates.
        assert_eq!(runner.run_once().await.unwrap(), 0);
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn ingest_auth_error_aborts_sweep() {
        let tracker = test_tracker();
        let source = MockSource::failing(PipelineError::AuthError("revoked".into()));
        let runner = IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["alerts".into()]),
        );

        let err = runner.run_once().await.unwrap_err();
        assert!(matches!(err, PipelineError::AuthError(_)));
    }

    #[tokio::test]
    async fn ingest_tolerates_channel_failures() {
        let tracker = test_tracker();
        let source = MockSource::with_texts("good", &["hello"])
            .failing_channel("bad", PipelineError::SourceError("timeout".into()));
        let runner = IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["bad".into(), "good".into()]),
        );

        // The bad channel is contained; the good one still lands.
        assert_eq!(runner.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn runner_completes_runnable_items() {
        let tracker = test_tracker();
        let sink = MemorySink::new();
        let source = MockSource::with_texts("alerts", &["a", "b", "c"]);
        let ingest = IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["alerts".into()]),
        );
        ingest.run_once().await.unwrap();

        let executor = ScriptedExecutor::always_ok(StageKind::Extraction, json!({"clean": true}));
        let runner = StageRunner::new(tracker.clone(), executor, sink.clone(), runner_config(2));
        runner.drain().await;

        let counts = tracker.count_by_status(StageKind::Extraction);
        assert_eq!(counts.get(&crate::item::StageStatus::Done), Some(&3));
        assert_eq!(sink.total_writes(), 3);
    }

    #[tokio::test]
    async fn runner_skips_when_executor_says_so() {
        let tracker = test_tracker();
        let sink = MemorySink::new();
        let source = MockSource::with_texts("alerts", &["a"]);
        IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["alerts".into()]),
        )
        .run_once()
        .await
        .unwrap();

        let executor =
            ScriptedExecutor::always_skipping(StageKind::Extraction, "nothing to normalize");
        let runner = StageRunner::new(tracker.clone(), executor, sink.clone(), runner_config(1));
        runner.drain().await;

        let item_id = tracker.get_runnable(StageKind::TextEnrichment, 1);
        // Extraction skipped still satisfies the dependency.
        assert_eq!(item_id.len(), 1);
        assert_eq!(sink.total_writes(), 0);
    }

    #[tokio::test]
    async fn runner_retries_until_bound_then_terminal() {
        let tracker = test_tracker();
        let sink = MemorySink::new();
        let source = MockSource::with_texts("alerts", &["a"]);
        IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["alerts".into()]),
        )
        .run_once()
        .await
        .unwrap();

        let executor = ScriptedExecutor::always_failing(
            StageKind::Extraction,
            || PipelineError::SourceError("flaky".into()),
        );
        let calls = executor.calls();
        let runner = StageRunner::new(tracker.clone(), executor, sink.clone(), runner_config(1));
        runner.drain().await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        let counts = tracker.count_by_status(StageKind::Extraction);
        assert_eq!(counts.get(&crate::item::StageStatus::Failed), Some(&1));
        assert_eq!(sink.total_writes(), 0);
    }

    #[tokio::test]
    async fn sink_outage_pauses_without_charging_attempts() {
        let tracker = test_tracker();
        // Two failed persists, then the sink recovers.
        let sink = FlakySink::failing_persists(2);
        let source = MockSource::with_texts("alerts", &["a"]);
        IngestRunner::new(
            source,
            tracker.clone(),
            TokenBucket::new(10, 10.0),
            ingest_config(vec!["alerts".into()]),
        )
        .run_once()
        .await
        .unwrap();

        let executor = ScriptedExecutor::always_ok(StageKind::Extraction, json!({"clean": true}));
        let calls = executor.calls();
        let runner = StageRunner::new(tracker.clone(), executor, sink.clone(), runner_config(1));
        runner.drain().await;

        let id = tracker.items()[0].id;
        let state = tracker
            .get(id)
            .unwrap()
            .stage(StageKind::Extraction)
            .cloned()
            .unwrap();
        assert_eq!(state.status, crate::item::StageStatus::Done);
        // Re-runs after a failed persist are free; only the successful
        // invocation is charged against the retry budget.
        assert_eq!(state.attempts, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(sink.persist_calls(), 3);
        assert_eq!(sink.inner().write_count(id, StageKind::Extraction), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let tracker = test_tracker();
        let sink = MemorySink::new();
        let executor = ScriptedExecutor::always_ok(StageKind::Extraction, json!({}));
        let runner = Arc::new(StageRunner::new(
            tracker,
            executor,
            sink,
            runner_config(1),
        ));

        let cancel = CancellationToken::new();
        let handle = {
            let runner = Arc::clone(&runner);
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(cancel).await })
        };
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("runner did not stop")
            .unwrap();
    }
}
