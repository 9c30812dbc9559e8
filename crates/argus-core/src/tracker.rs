//! Durable record of each item's progress through the stages.
//!
//! The tracker is the single source of truth for "what still needs to run".
//! Every transition is a single atomic operation under one lock; when two
//! workers race to claim the same (item, stage), exactly one `mark_running`
//! succeeds and the loser observes [`PipelineError::StaleTransition`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::item::{
    ContentItem, ItemStatus, OutputRef, RawMessage, StageKind, StagePlan, StageState, StageStatus,
};

/// Result of an idempotent `create` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    /// An item with the same source key already exists; re-ingestion is a no-op.
    Existing(Uuid),
}

impl CreateOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            CreateOutcome::Created(id) | CreateOutcome::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// How a `mark_failed` call was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Retry scheduled after backoff.
    Retrying,
    /// No further scheduling for this (item, stage).
    Terminal,
}

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, ContentItem>,
    by_source: HashMap<String, Uuid>,
}

/// In-memory item state tracker.
///
/// Cloning shares the same state. Items are exclusively owned by the tracker
/// from creation until eviction; callers get cloned snapshots.
#[derive(Clone)]
pub struct ItemTracker {
    plan: Arc<StagePlan>,
    inner: Arc<Mutex<Inner>>,
}

impl ItemTracker {
    pub fn new(plan: StagePlan) -> Self {
        Self {
            plan: Arc::new(plan),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn plan(&self) -> Arc<StagePlan> {
        Arc::clone(&self.plan)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned tracker mutex");
            poisoned.into_inner()
        })
    }

    /// Create an item from a raw source message.
    ///
    /// Idempotent by source key: a second call with the same channel +
    /// external id returns the existing id without touching its state.
    pub fn create(&self, raw: &RawMessage) -> CreateOutcome {
        let mut inner = self.lock_inner();
        let key = raw.source_key();
        if let Some(&existing) = inner.by_source.get(&key) {
            tracing::debug!(source_key = %key, item_id = %existing, "Duplicate item, returning existing");
            return CreateOutcome::Existing(existing);
        }
        let item = ContentItem::from_raw(raw, &self.plan);
        let id = item.id;
        inner.by_source.insert(key, id);
        inner.items.insert(id, item);
        CreateOutcome::Created(id)
    }

    pub fn get(&self, id: Uuid) -> Option<ContentItem> {
        self.lock_inner().items.get(&id).cloned()
    }

    pub fn item_status(&self, id: Uuid) -> Option<ItemStatus> {
        self.lock_inner().items.get(&id).map(|i| i.status())
    }

    /// Items whose `stage` is runnable right now: Pending, or Failed with a
    /// retry scheduled and the backoff elapsed, with every dependency stage
    /// Done or Skipped. Oldest-created-first, up to `batch`.
    pub fn get_runnable(&self, stage: StageKind, batch: usize) -> Vec<Uuid> {
        let inner = self.lock_inner();
        let Some(def) = self.plan.definition(stage) else {
            return Vec::new();
        };
        let now = Utc::now();

        let mut runnable: Vec<(&ContentItem, Uuid)> = inner
            .items
            .values()
            .filter(|item| {
                let Some(state) = item.stage(stage) else {
                    return false;
                };
                let due = match state.status {
                    StageStatus::Pending => true,
                    StageStatus::Failed => {
                        state.next_attempt_at.is_some_and(|at| at <= now)
                    }
                    _ => false,
                };
                due && self.deps_satisfied(item, &def.depends_on)
            })
            .map(|item| (item, item.id))
            .collect();

        runnable.sort_by_key(|(item, _)| item.created_at);
        runnable.into_iter().take(batch).map(|(_, id)| id).collect()
    }

    fn deps_satisfied(&self, item: &ContentItem, deps: &[StageKind]) -> bool {
        deps.iter().all(|dep| {
            item.stage(*dep)
                .is_some_and(|s| s.status.satisfies_dependency())
        })
    }

    /// Claim a stage for execution. Exactly one of several racing callers
    /// succeeds; the rest observe `StaleTransition` and skip the unit of work.
    ///
    /// Each successful claim counts one invocation attempt.
    pub fn mark_running(&self, id: Uuid, stage: StageKind) -> Result<(), PipelineError> {
        let mut inner = self.lock_inner();
        let deps = self
            .plan
            .definition(stage)
            .map(|d| d.depends_on.clone())
            .unwrap_or_default();
        let now = Utc::now();

        let item = inner
            .items
            .get_mut(&id)
            .ok_or(PipelineError::StaleTransition { item_id: id, stage })?;
        if !self.deps_satisfied(item, &deps) {
            return Err(PipelineError::StaleTransition { item_id: id, stage });
        }
        let state = item
            .stages
            .get_mut(&stage)
            .ok_or(PipelineError::StaleTransition { item_id: id, stage })?;

        let claimable = match state.status {
            StageStatus::Pending => true,
            StageStatus::Failed => state.next_attempt_at.is_some_and(|at| at <= now),
            _ => false,
        };
        if !claimable {
            return Err(PipelineError::StaleTransition { item_id: id, stage });
        }

        state.status = StageStatus::Running;
        state.attempts += 1;
        state.next_attempt_at = None;
        Ok(())
    }

    pub fn mark_done(
        &self,
        id: Uuid,
        stage: StageKind,
        output_ref: OutputRef,
    ) -> Result<(), PipelineError> {
        self.transition(id, stage, |state| {
            if state.status != StageStatus::Running {
                return Err(());
            }
            state.status = StageStatus::Done;
            state.output_ref = Some(output_ref);
            state.last_error = None;
            state.next_attempt_at = None;
            Ok(())
        })
    }

    /// Record a bypassed stage. Skipped counts as satisfied for dependents.
    pub fn mark_skipped(
        &self,
        id: Uuid,
        stage: StageKind,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let reason = reason.to_string();
        self.transition(id, stage, move |state| {
            if !matches!(state.status, StageStatus::Pending | StageStatus::Running) {
                return Err(());
            }
            state.status = StageStatus::Skipped;
            state.skip_reason = Some(reason.clone());
            state.next_attempt_at = None;
            Ok(())
        })
    }

    /// Record a failed attempt. Retryable errors get a backoff-delayed retry
    /// until the attempt count reaches the stage's `max_retries`; permanent
    /// errors terminal-fail immediately.
    pub fn mark_failed(
        &self,
        id: Uuid,
        stage: StageKind,
        error: &PipelineError,
    ) -> Result<FailureDisposition, PipelineError> {
        let def = self
            .plan
            .definition(stage)
            .ok_or(PipelineError::StaleTransition { item_id: id, stage })?
            .clone();
        let message = error.to_string();
        let retryable = error.is_retryable();

        let mut disposition = FailureDisposition::Terminal;
        self.transition(id, stage, |state| {
            if state.status != StageStatus::Running {
                return Err(());
            }
            state.status = StageStatus::Failed;
            state.last_error = Some(message.clone());
            if retryable && state.attempts < def.max_retries {
                let delay = def.backoff.delay_for_attempt(state.attempts);
                state.next_attempt_at = Some(Utc::now() + delay);
                disposition = FailureDisposition::Retrying;
            } else {
                state.next_attempt_at = None;
                disposition = FailureDisposition::Terminal;
            }
            Ok(())
        })?;
        Ok(disposition)
    }

    /// Return a claimed stage without charging the attempt, for outcomes
    /// that could not be recorded (e.g. the sink was unreachable). The
    /// stage becomes claimable again immediately.
    pub fn release_claim(
        &self,
        id: Uuid,
        stage: StageKind,
        error: &PipelineError,
    ) -> Result<(), PipelineError> {
        let message = error.to_string();
        self.transition(id, stage, move |state| {
            if state.status != StageStatus::Running {
                return Err(());
            }
            state.status = StageStatus::Failed;
            state.attempts = state.attempts.saturating_sub(1);
            state.last_error = Some(message);
            state.next_attempt_at = Some(Utc::now());
            Ok(())
        })
    }

    fn transition<F>(&self, id: Uuid, stage: StageKind, f: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut StageState) -> Result<(), ()>,
    {
        let mut inner = self.lock_inner();
        let item = inner
            .items
            .get_mut(&id)
            .ok_or(PipelineError::StaleTransition { item_id: id, stage })?;
        let state = item
            .stages
            .get_mut(&stage)
            .ok_or(PipelineError::StaleTransition { item_id: id, stage })?;
        f(state).map_err(|_| PipelineError::StaleTransition { item_id: id, stage })?;

        // Done, or failed for good: either way the item is finished. A
        // terminal stage failure strands its dependents in Pending, so
        // waiting for every stage to become terminal would leak the item.
        if item.finished_at.is_none() && item.status() != ItemStatus::InFlight {
            item.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Per-status item counts for one stage. Operator visibility only.
    pub fn count_by_status(&self, stage: StageKind) -> HashMap<StageStatus, usize> {
        let inner = self.lock_inner();
        let mut counts = HashMap::new();
        for item in inner.items.values() {
            if let Some(state) = item.stage(stage) {
                *counts.entry(state.status).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Snapshot of every tracked item, oldest first.
    pub fn items(&self) -> Vec<ContentItem> {
        let inner = self.lock_inner();
        let mut items: Vec<ContentItem> = inner.items.values().cloned().collect();
        items.sort_by_key(|item| item.created_at);
        items
    }

    pub fn len(&self) -> usize {
        self.lock_inner().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().items.is_empty()
    }

    /// Evict items that reached a terminal state longer than `retention` ago.
    /// The sink keeps the persisted form; the tracker forgets them.
    pub fn evict_finished(&self, retention: Duration) -> usize {
        let mut inner = self.lock_inner();
        let cutoff = Utc::now()
            - TimeDelta::from_std(retention).unwrap_or_else(|_| TimeDelta::seconds(3600));
        let expired: Vec<Uuid> = inner
            .items
            .values()
            .filter(|item| item.finished_at.is_some_and(|at| at <= cutoff))
            .map(|item| item.id)
            .collect();
        for id in &expired {
            if let Some(item) = inner.items.remove(id) {
                inner.by_source.remove(&item.source_key);
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Evicted finished items");
        }
        expired.len()
    }
}
