use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::catalog::Catalog;
use crate::context::RunContext;
use crate::error::{PipelineError, Result, StageFailure};
use crate::listener::{Callbacks, ListenerSet, PipelineListener};
use crate::observability::MetricsCollector;
use crate::runner::{DEFAULT_PROGRESS_STEP, StageRunner, elapsed_ms};
use crate::stage::{StageDefinition, StageId, StageOutcome, StageWork};

pub const DEFAULT_INTER_STAGE_DELAY_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_progress_step")]
    pub progress_step: u8,
    #[serde(default = "default_inter_stage_delay_ms")]
    pub inter_stage_delay_ms: u64,
}

fn default_progress_step() -> u8 {
    DEFAULT_PROGRESS_STEP
}

fn default_inter_stage_delay_ms() -> u64 {
    DEFAULT_INTER_STAGE_DELAY_MS
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            progress_step: default_progress_step(),
            inter_stage_delay_ms: default_inter_stage_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub per_stage: Vec<StageOutcome>,
    pub total_elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
}

impl PipelineResult {
    pub fn outcome(&self, stage: StageId) -> Option<&StageOutcome> {
        self.per_stage.iter().find(|outcome| outcome.stage_id == stage)
    }

    pub fn data(&self, stage: StageId) -> Option<&Value> {
        self.outcome(stage)
            .filter(|outcome| outcome.success)
            .map(|outcome| &outcome.data)
    }

    /// Payload of the last stage that ran successfully.
    pub fn final_output(&self) -> Option<&Value> {
        self.per_stage
            .iter()
            .rev()
            .find(|outcome| outcome.success)
            .map(|outcome| &outcome.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatistics {
    pub total_stages: usize,
    pub is_processing: bool,
    pub current_step: Option<StageId>,
    pub state: PipelineState,
    pub runs_started: u64,
}

#[derive(Debug)]
struct RunBook {
    state: PipelineState,
    current_step: Option<StageId>,
    runs_started: u64,
}

/// Walks a fixed, ordered list of stages one at a time.
///
/// At most one run is in flight per instance. `reset()` may be called from
/// another task while `run()` is pending; the pending run then resolves to
/// `PipelineError::Cancelled` at its next suspension point and fires no
/// further callbacks.
pub struct PipelineOrchestrator {
    stages: Vec<StageDefinition>,
    runner: StageRunner,
    config: PipelineConfig,
    metrics: MetricsCollector,
    listeners: Mutex<ListenerSet>,
    book: Mutex<RunBook>,
    generation: watch::Sender<u64>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .field("listeners", &self.listeners().len())
            .field("state", &self.state())
            .finish()
    }
}

impl PipelineOrchestrator {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.book().state
    }

    pub fn statistics(&self) -> PipelineStatistics {
        let book = self.book();
        PipelineStatistics {
            total_stages: self.stages.len(),
            is_processing: book.state == PipelineState::Running,
            current_step: book.current_step,
            state: book.state,
            runs_started: book.runs_started,
        }
    }

    /// Register a bundle of optional callbacks. Registrations accumulate and
    /// take effect from the next run.
    pub fn register_callbacks(&self, callbacks: Callbacks) {
        self.register_listener(Arc::new(callbacks));
    }

    pub fn register_listener(&self, listener: Arc<dyn PipelineListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Return to `Idle` from any state. Cancels the in-flight run, if any.
    /// A no-op when already idle.
    pub fn reset(&self) {
        let mut book = self.book();
        if book.state == PipelineState::Idle {
            return;
        }
        let was = book.state;
        self.generation.send_modify(|generation| *generation += 1);
        book.state = PipelineState::Idle;
        book.current_step = None;
        info!(from = ?was, "Pipeline reset");
    }

    /// Walk every stage in registration order, stopping at the first failure.
    ///
    /// Stage failures are reported through the returned `PipelineResult`
    /// (`success == false`), not as an `Err`. `Err` is reserved for
    /// `AlreadyRunning` and for runs cancelled by `reset()`.
    pub async fn run(&self, input: Value) -> Result<PipelineResult> {
        let (run_generation, cancelled) = self.begin_run()?;
        let span = info_span!(
            "pipeline_run",
            generation = run_generation,
            stages = self.stages.len()
        );
        let mut guard = RunGuard {
            orchestrator: self,
            generation: run_generation,
            armed: true,
        };
        let result = self
            .walk(run_generation, cancelled, input)
            .instrument(span)
            .await;
        guard.armed = false;
        result
    }

    fn begin_run(&self) -> Result<(u64, watch::Receiver<u64>)> {
        let mut book = self.book();
        if book.state == PipelineState::Running {
            warn!("Rejected run: pipeline already running");
            return Err(PipelineError::AlreadyRunning);
        }
        book.state = PipelineState::Running;
        book.current_step = None;
        book.runs_started += 1;
        let mut cancelled = self.generation.subscribe();
        let run_generation = *cancelled.borrow_and_update();
        Ok((run_generation, cancelled))
    }

    async fn walk(
        &self,
        run_generation: u64,
        mut cancelled: watch::Receiver<u64>,
        input: Value,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let listeners = self.listeners();
        let mut ctx = RunContext::new(input);
        let mut per_stage = Vec::with_capacity(self.stages.len());
        info!("Pipeline started");

        for (index, stage) in self.stages.iter().enumerate() {
            if !self.enter_stage(run_generation, stage.id()) {
                return Err(PipelineError::Cancelled);
            }
            let descriptor = stage.descriptor();
            listeners.step_start(descriptor);

            let execution = self.runner.execute(stage, &ctx, |percent| {
                listeners.step_progress(descriptor, percent)
            });
            let outcome = tokio::select! {
                biased;
                _ = cancelled.changed() => {
                    debug!(stage_id = %stage.id(), "Run cancelled during stage");
                    return Err(PipelineError::Cancelled);
                }
                outcome = execution => outcome,
            };
            if !self.is_current(run_generation) {
                return Err(PipelineError::Cancelled);
            }

            self.metrics
                .record_for(descriptor, outcome.elapsed_ms, outcome.success);

            if !outcome.success {
                let failure = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| StageFailure::new(stage.id(), "stage reported failure"));
                per_stage.push(outcome);
                let result = PipelineResult {
                    success: false,
                    per_stage,
                    total_elapsed_ms: elapsed_ms(started),
                    failed_at: Some(stage.id()),
                    error: Some(failure.clone()),
                };
                if !self.finish(run_generation, PipelineState::Failed) {
                    return Err(PipelineError::Cancelled);
                }
                warn!(
                    stage_id = %stage.id(),
                    stage = stage.name(),
                    error = %failure.message,
                    "Pipeline halted"
                );
                listeners.failure(descriptor, &failure);
                return Ok(result);
            }

            info!(
                stage_id = %stage.id(),
                stage = stage.name(),
                duration_ms = outcome.elapsed_ms,
                "Stage complete"
            );
            listeners.step_complete(descriptor, &outcome);
            ctx.record(stage.id(), outcome.data.clone());
            per_stage.push(outcome);

            let is_last = index + 1 == self.stages.len();
            if !is_last && self.config.inter_stage_delay_ms > 0 {
                let delay = Duration::from_millis(self.config.inter_stage_delay_ms);
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => return Err(PipelineError::Cancelled),
                    _ = time::sleep(delay) => {}
                }
            }
        }

        let result = PipelineResult {
            success: true,
            per_stage,
            total_elapsed_ms: elapsed_ms(started),
            failed_at: None,
            error: None,
        };
        if !self.finish(run_generation, PipelineState::Completed) {
            return Err(PipelineError::Cancelled);
        }
        info!(total_ms = result.total_elapsed_ms, "Pipeline complete");
        listeners.all_complete(&result);
        Ok(result)
    }

    fn book(&self) -> MutexGuard<'_, RunBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> ListenerSet {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_current(&self, run_generation: u64) -> bool {
        *self.generation.borrow() == run_generation
    }

    fn enter_stage(&self, run_generation: u64, stage: StageId) -> bool {
        let mut book = self.book();
        if !self.is_current(run_generation) {
            return false;
        }
        book.current_step = Some(stage);
        true
    }

    fn finish(&self, run_generation: u64, state: PipelineState) -> bool {
        let mut book = self.book();
        if !self.is_current(run_generation) {
            return false;
        }
        book.state = state;
        self.metrics.record_run(state == PipelineState::Completed);
        true
    }
}

/// Returns the orchestrator to `Idle` when a run future is dropped before it
/// reaches a terminal state.
struct RunGuard<'a> {
    orchestrator: &'a PipelineOrchestrator,
    generation: u64,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut book = self.orchestrator.book();
        if self.orchestrator.is_current(self.generation) && book.state == PipelineState::Running
        {
            debug!("Run dropped before completion");
            self.orchestrator
                .generation
                .send_modify(|generation| *generation += 1);
            book.state = PipelineState::Idle;
            book.current_step = None;
        }
    }
}

pub struct PipelineBuilder {
    stages: Vec<StageDefinition>,
    config: PipelineConfig,
    metrics: Option<MetricsCollector>,
    listeners: ListenerSet,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            config: PipelineConfig::default(),
            metrics: None,
            listeners: ListenerSet::default(),
        }
    }

    pub fn add_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_stages(mut self, stages: impl IntoIterator<Item = StageDefinition>) -> Self {
        self.stages.extend(stages);
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Report into `metrics` instead of the process-wide collector.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_callbacks(self, callbacks: Callbacks) -> Self {
        self.with_listener(Arc::new(callbacks))
    }

    pub fn build(self) -> Result<PipelineOrchestrator> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Pipeline must have at least one stage".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Duplicate stage id {}",
                    stage.id()
                )));
            }
        }

        let (generation, _) = watch::channel(0);
        Ok(PipelineOrchestrator {
            stages: self.stages,
            runner: StageRunner::new(self.config.progress_step),
            config: self.config,
            metrics: self
                .metrics
                .unwrap_or_else(|| MetricsCollector::global().clone()),
            listeners: Mutex::new(self.listeners),
            book: Mutex::new(RunBook {
                state: PipelineState::Idle,
                current_step: None,
                runs_started: 0,
            }),
            generation,
        })
    }
}

pub type StageParameters = Map<String, Value>;

type StageConstructor =
    Arc<dyn Fn(StageParameters, &Catalog) -> anyhow::Result<Arc<dyn StageWork>> + Send + Sync>;

/// Maps agent kinds named in a catalog to constructors for their work.
pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters, &Catalog) -> anyhow::Result<Arc<dyn StageWork>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        name: &str,
        params: StageParameters,
        catalog: &Catalog,
    ) -> anyhow::Result<Arc<dyn StageWork>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown agent '{}'. Available agents: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params, catalog)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Instantiate every stage in `catalog` and assemble an orchestrator.
pub fn build_pipeline(
    registry: &StageRegistry,
    catalog: &Catalog,
    config: PipelineConfig,
    metrics: MetricsCollector,
) -> anyhow::Result<PipelineOrchestrator> {
    let mut stages = Vec::with_capacity(catalog.stages.len());
    for spec in &catalog.stages {
        let params = spec.params.clone().unwrap_or_default();
        let work = registry
            .create(&spec.agent, params, catalog)
            .map_err(|err| err.context(format!("Stage {} ('{}')", spec.id, spec.name)))?;
        stages.push(StageDefinition::new(spec.descriptor(), work));
    }

    Ok(PipelineOrchestrator::builder()
        .with_stages(stages)
        .with_config(config)
        .with_metrics(metrics)
        .build()?)
}
