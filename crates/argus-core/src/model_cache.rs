//! Lazy cache for heavyweight inference resources.
//!
//! Loading a model is expensive, so the cost is amortized: the first
//! `acquire` for a resource loads it while concurrent requesters for the same
//! resource wait on that single load, and everyone then shares the handle.
//! Idle resources are unloaded after a configurable TTL.
//!
//! Load failures surface as [`PipelineError::ModelLoad`] and are never
//! retried here; retry policy belongs to the scheduler.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;

use crate::error::PipelineError;

/// Loads an inference resource by identifier.
pub trait ModelLoader: Send + Sync + Clone + 'static {
    type Model: Send + Sync + 'static;

    fn load(
        &self,
        resource_id: &str,
    ) -> impl Future<Output = Result<Self::Model, PipelineError>> + Send;
}

/// A loaded resource plus its bookkeeping.
#[derive(Debug)]
pub struct ModelEntry<M> {
    model: M,
    loaded_at: DateTime<Utc>,
    refs: AtomicUsize,
}

/// Borrowed reference to a loaded model.
///
/// Stages hold a handle only for the duration of one invocation; dropping it
/// releases the reference. The underlying resource stays cached until its
/// idle TTL expires.
#[derive(Debug)]
pub struct ModelHandle<M> {
    entry: Arc<ModelEntry<M>>,
}

impl<M> ModelHandle<M> {
    pub fn model(&self) -> &M {
        &self.entry.model
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.entry.loaded_at
    }

    /// Handles currently alive for this resource.
    pub fn active_refs(&self) -> usize {
        self.entry.refs.load(Ordering::SeqCst)
    }
}

impl<M> Clone for ModelHandle<M> {
    fn clone(&self) -> Self {
        self.entry.refs.fetch_add(1, Ordering::SeqCst);
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<M> Drop for ModelHandle<M> {
    fn drop(&mut self) {
        self.entry.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cache of loaded models keyed by resource identifier.
pub struct ModelCache<L: ModelLoader> {
    loader: L,
    cache: Cache<String, Arc<ModelEntry<L::Model>>>,
}

// Manual impl: a derive would also demand `L::Model: Clone`, and models are
// shared through the Arc'd entry rather than cloned.
impl<L: ModelLoader> Clone for ModelCache<L> {
    fn clone(&self) -> Self {
        Self {
            loader: self.loader.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<L: ModelLoader> ModelCache<L> {
    pub fn new(loader: L, idle_ttl: Duration) -> Self {
        Self {
            loader,
            cache: Cache::builder().time_to_idle(idle_ttl).build(),
        }
    }

    /// Get a handle to the model, loading it on first request.
    ///
    /// Concurrent requesters for the same `resource_id` block until the
    /// first load completes (at most one load per resource), then all share
    /// the cached entry.
    pub async fn acquire(
        &self,
        resource_id: &str,
    ) -> Result<ModelHandle<L::Model>, PipelineError> {
        let loader = self.loader.clone();
        let entry = self
            .cache
            .try_get_with(resource_id.to_string(), async move {
                tracing::info!(resource = %resource_id, "Loading model");
                let model = loader.load(resource_id).await?;
                Ok::<_, PipelineError>(Arc::new(ModelEntry {
                    model,
                    loaded_at: Utc::now(),
                    refs: AtomicUsize::new(0),
                }))
            })
            .await
            .map_err(|e: Arc<PipelineError>| PipelineError::ModelLoad(e.to_string()))?;

        entry.refs.fetch_add(1, Ordering::SeqCst);
        Ok(ModelHandle { entry })
    }

    pub async fn contains(&self, resource_id: &str) -> bool {
        self.cache.run_pending_tasks().await;
        self.cache.contains_key(resource_id)
    }

    /// Drop a resource regardless of TTL.
    pub async fn unload(&self, resource_id: &str) {
        self.cache.invalidate(resource_id).await;
    }
}
