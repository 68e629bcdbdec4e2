use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prismatic_contracts::batch::{
    Batch, BatchId, BatchRequest, BatchResult, BatchStatus, BatchStatusView, ResultKind,
};
use prismatic_contracts::events::{BatchEvent, NotificationSink};
use prismatic_contracts::models::{ModelRegistry, ModelSelector, CAPABILITY_EDIT};
use prismatic_contracts::presets::{
    prompt_variables, render_template, PresetStore, ANGLE_TEMPLATE, COLOR_TEMPLATE,
};
use serde_json::{json, Map};
use tokio::task::JoinHandle;

use crate::config::{DependencyFailurePolicy, EngineConfig};
use crate::error::{transition_error, EngineError, EngineResult};
use crate::providers::{EditRequest, ProviderOutput, ProviderTable};
use crate::queue::JobQueue;
use crate::store::BatchStore;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub angle_model: String,
    pub color_model: String,
    pub on_angle_failure: DependencyFailurePolicy,
    pub batch_ttl: Duration,
    pub max_concurrent_jobs: usize,
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            angle_model: config.angle_model.clone(),
            color_model: config.color_model.clone(),
            on_angle_failure: config.on_angle_failure,
            batch_ttl: config.batch_ttl,
            max_concurrent_jobs: config.max_concurrent_jobs,
        }
    }
}

/// Turns batch requests into a graph of angle and color jobs and drives each
/// job to a terminal state. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: OrchestratorSettings,
    selector: ModelSelector,
    providers: ProviderTable,
    presets: Arc<dyn PresetStore>,
    store: Arc<dyn BatchStore>,
    sink: Arc<dyn NotificationSink>,
    queue: JobQueue,
    /// Serializes every read-modify-write of a batch plus its notifications.
    transitions: Mutex<()>,
}

impl BatchOrchestrator {
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: OrchestratorSettings,
        registry: ModelRegistry,
        providers: ProviderTable,
        presets: Arc<dyn PresetStore>,
        store: Arc<dyn BatchStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let queue = JobQueue::new(settings.max_concurrent_jobs);
        Self {
            inner: Arc::new(Inner {
                settings,
                selector: ModelSelector::new(registry),
                providers,
                presets,
                store,
                sink,
                queue,
                transitions: Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Validates the request, stores the batch and schedules its angle jobs.
    /// Returns before any job has finished.
    pub fn create_batch(&self, request: BatchRequest) -> EngineResult<BatchId> {
        let request = request
            .normalize()
            .map_err(EngineError::InvalidBatchRequest)?;
        let mut warnings = Vec::new();
        let angle_model = self.select_model(
            request.angle_model.as_deref(),
            &self.inner.settings.angle_model,
            ResultKind::Angle,
            &mut warnings,
        )?;
        let color_model = if request.wants_colors() {
            self.select_model(
                request.color_model.as_deref(),
                &self.inner.settings.color_model,
                ResultKind::Color,
                &mut warnings,
            )?
        } else {
            request
                .color_model
                .clone()
                .unwrap_or_else(|| self.inner.settings.color_model.clone())
        };

        let mut batch = Batch::new(
            BatchId::generate(),
            request,
            angle_model,
            color_model,
            Utc::now(),
        );
        batch.warnings = warnings;
        let batch_id = batch.id.clone();
        let angle_indices = batch.angle_indices();

        {
            let _guard = self.lock();
            let created = BatchEvent::batch_created(&batch);
            batch.start();
            self.inner.store.put(batch);
            created.publish_to(self.inner.sink.as_ref());
        }
        tracing::info!(
            batch_id = %batch_id,
            angle_jobs = angle_indices.len(),
            "batch created"
        );

        for index in angle_indices {
            self.schedule_result(&batch_id, index);
        }
        Ok(batch_id)
    }

    fn select_model(
        &self,
        requested: Option<&str>,
        default: &str,
        kind: ResultKind,
        warnings: &mut Vec<String>,
    ) -> EngineResult<String> {
        let wanted = requested.unwrap_or(default);
        let providers = &self.inner.providers;
        let selection = self
            .inner
            .selector
            .select(wanted, CAPABILITY_EDIT, |model| {
                providers.supports_edit(&model.name)
            })?;
        if let Some(warning) = selection.warning(kind.as_str()) {
            tracing::warn!(requested = wanted, model = %selection.model.name, "model fallback");
            warnings.push(warning);
        }
        Ok(selection.model.name)
    }

    /// Queues a result on the worker pool. Failures are recorded on the result.
    pub fn schedule_result(&self, batch_id: &BatchId, index: usize) {
        let this = self.clone();
        let job_batch = batch_id.clone();
        let queued = self.inner.queue.submit(async move {
            if let Err(err) = this.run_result(&job_batch, index).await {
                tracing::warn!(batch_id = %job_batch, index, error = %err, "result could not run");
            }
        });
        if !queued {
            tracing::warn!(batch_id = %batch_id, index, "job queue closed; result left pending");
        }
    }

    /// Runs one result to a terminal state. Provider and preset failures are
    /// recorded on the result and return `Ok`; only a result that cannot
    /// start (unknown, already started, or waiting on its angle) is an error.
    pub async fn run_result(&self, batch_id: &BatchId, index: usize) -> EngineResult<()> {
        let (batch, result) = self.with_batch(batch_id, |batch, events| {
            batch
                .begin_result(index, Utc::now())
                .map_err(|err| transition_error(batch_id.as_str(), err))?;
            let result = batch.results[index].clone();
            events.push(BatchEvent::result_updated(&batch.id, &result));
            Ok((batch.clone(), result))
        })?;
        tracing::info!(batch_id = %batch_id, index, result = %result.label(), "result started");

        match self.execute(&batch, &result).await {
            Ok(output) => self.record_success(batch_id, &result, output),
            Err(err) => self.record_failure(batch_id, &result, err),
        }
    }

    async fn execute(&self, batch: &Batch, result: &BatchResult) -> EngineResult<ProviderOutput> {
        let presets = self.inner.presets.as_ref();
        let angle = presets.angle(&result.angle_key)?;
        let (template, color, images, model) = match result.kind {
            ResultKind::Angle => (
                ANGLE_TEMPLATE,
                None,
                batch.source_image_urls.clone(),
                batch.angle_model.as_str(),
            ),
            ResultKind::Color => {
                let color_key = result.color_key.as_deref().unwrap_or_default();
                let color = presets.color(color_key)?;
                let angle_image = result
                    .depends_on
                    .and_then(|angle_index| batch.result(angle_index))
                    .and_then(|angle_result| angle_result.image_url.clone())
                    .ok_or_else(|| EngineError::DependencyNotSatisfied {
                        batch_id: batch.id.to_string(),
                        index: result.index,
                        reason: "angle result has no image".to_string(),
                    })?;
                (
                    COLOR_TEMPLATE,
                    Some(color),
                    vec![angle_image],
                    batch.color_model.as_str(),
                )
            }
        };
        let template = presets.template(template)?;
        let prompt = render_template(&template, &prompt_variables(&angle, color.as_ref()));

        let mut metadata = Map::new();
        metadata.insert("batch_id".to_string(), json!(batch.id));
        metadata.insert("index".to_string(), json!(result.index));
        metadata.insert("type".to_string(), json!(result.kind.as_str()));
        metadata.insert("angle".to_string(), json!(result.angle_key));
        if let Some(color_key) = &result.color_key {
            metadata.insert("color".to_string(), json!(color_key));
        }

        let request = EditRequest {
            prompt,
            images,
            mask: None,
            params: batch.params.clone(),
            metadata,
        };
        self.inner.providers.edit(model, &request).await
    }

    fn record_success(
        &self,
        batch_id: &BatchId,
        result: &BatchResult,
        output: ProviderOutput,
    ) -> EngineResult<()> {
        let Some(image) = output.images.into_iter().next() else {
            return self.record_failure(
                batch_id,
                result,
                EngineError::InvalidOutput("provider returned no images".to_string()),
            );
        };
        let index = result.index;
        let dependents = self.with_batch(batch_id, |batch, events| {
            let dependents = batch
                .complete_result(index, image.full_url, image.thumb_url, output.job_id, Utc::now())
                .map_err(|err| transition_error(batch_id.as_str(), err))?;
            events.push(BatchEvent::result_updated(&batch.id, &batch.results[index]));
            complete_if_done(batch, events);
            Ok(dependents)
        })?;
        tracing::info!(
            batch_id = %batch_id,
            index,
            result = %result.label(),
            unlocked = dependents.len(),
            "result completed"
        );
        for dependent in dependents {
            self.schedule_result(batch_id, dependent);
        }
        Ok(())
    }

    fn record_failure(
        &self,
        batch_id: &BatchId,
        result: &BatchResult,
        err: EngineError,
    ) -> EngineResult<()> {
        let index = result.index;
        tracing::warn!(
            batch_id = %batch_id,
            index,
            result = %result.label(),
            error = %err,
            "result failed"
        );
        let policy = self.inner.settings.on_angle_failure;
        self.with_batch(batch_id, |batch, events| {
            let now = Utc::now();
            batch
                .fail_result(index, err.to_string(), err.job_id().map(str::to_string), now)
                .map_err(|err| transition_error(batch_id.as_str(), err))?;
            events.push(BatchEvent::result_updated(&batch.id, &batch.results[index]));
            if result.kind == ResultKind::Angle {
                match policy {
                    DependencyFailurePolicy::Propagate => {
                        for dependent in batch.propagate_failure(index, now) {
                            let updated = &batch.results[dependent];
                            events.push(BatchEvent::result_updated(&batch.id, updated));
                        }
                    }
                    DependencyFailurePolicy::LeavePending => {
                        if !batch.results[index].dependents.is_empty() {
                            tracing::warn!(
                                batch_id = %batch_id,
                                index,
                                "angle failed; dependent color results stay pending"
                            );
                        }
                    }
                }
            }
            complete_if_done(batch, events);
            Ok(())
        })
    }

    /// Re-runs the completion check. Returns `true` only for the call that
    /// actually completed the batch.
    pub fn check_completion(&self, batch_id: &BatchId) -> EngineResult<bool> {
        self.with_batch(batch_id, |batch, events| Ok(complete_if_done(batch, events)))
    }

    pub fn get_batch_status(&self, batch_id: &BatchId) -> EngineResult<BatchStatusView> {
        self.inner
            .store
            .get(batch_id)
            .map(|batch| batch.status_view())
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.inner.store.ids()
    }

    /// Drops completed batches whose TTL has run out.
    pub fn evict_expired(&self) -> Vec<BatchId> {
        let Ok(ttl) = chrono::Duration::from_std(self.inner.settings.batch_ttl) else {
            return Vec::new();
        };
        match Utc::now().checked_sub_signed(ttl) {
            Some(cutoff) => self.evict_completed_before(cutoff),
            None => Vec::new(),
        }
    }

    pub fn evict_completed_before(&self, cutoff: DateTime<Utc>) -> Vec<BatchId> {
        let _guard = self.lock();
        let mut evicted = Vec::new();
        for id in self.inner.store.ids() {
            let expired = self
                .inner
                .store
                .get(&id)
                .map(|batch| {
                    batch.status == BatchStatus::Completed
                        && batch.completed_at.is_some_and(|at| at <= cutoff)
                })
                .unwrap_or(false);
            if expired && self.inner.store.delete(&id).is_some() {
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted completed batches");
        }
        evicted
    }

    /// Periodically evicts expired batches; stops once every orchestrator
    /// handle has been dropped.
    pub fn spawn_eviction_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                BatchOrchestrator { inner }.evict_expired();
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .transitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads a batch, applies `apply`, writes it back and publishes the
    /// collected events, all under the transition lock. Nothing is written
    /// when `apply` fails.
    fn with_batch<T>(
        &self,
        batch_id: &BatchId,
        apply: impl FnOnce(&mut Batch, &mut Vec<BatchEvent>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.lock();
        let mut batch = self
            .inner
            .store
            .get(batch_id)
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))?;
        let mut events = Vec::new();
        let out = apply(&mut batch, &mut events)?;
        self.inner.store.put(batch);
        for event in &events {
            event.publish_to(self.inner.sink.as_ref());
        }
        Ok(out)
    }
}

fn complete_if_done(batch: &mut Batch, events: &mut Vec<BatchEvent>) -> bool {
    if !batch.try_complete(Utc::now()) {
        return false;
    }
    let counts = batch.counts();
    tracing::info!(
        batch_id = %batch.id,
        completed = counts.completed,
        failed = counts.failed,
        "batch completed"
    );
    if let Some(event) = BatchEvent::batch_completed(batch) {
        events.push(event);
    }
    true
}
