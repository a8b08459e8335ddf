//! The caller-facing engine.
//!
//! [`Engine`] ties the ledger, the step set, the drivers and the resume
//! coordinator together behind four operations: `start`, `resume`,
//! `get_history` and `get_state`.

mod cache;
mod config;


pub use cache::StateCache;
pub use config::EngineConfig;

use crate::context::{PipelineContext, RunControls};
use crate::core::{RunId, RunStatus, StepName};
use crate::errors::{CheckpointError, EngineError};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::ledger::{AttemptLedger, HistoryEntry, InMemoryLedger};
use crate::pipeline::{
    Checkpoint, Checkpointer, DriverKind, GraphDriver, PipelineDriver, ResumeCoordinator,
    SequentialDriver, StepRunner,
};
use crate::steps::StepSet;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

/// Options for a fresh run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    /// Make qa fail until the loop bound is reached.
    pub force_qa_fail: bool,
    /// Loop bound. Falls back to the engine's configured default.
    pub max_qa_loops: Option<u32>,
    /// Forced failures per step.
    pub inject_failures: BTreeMap<StepName, u32>,
    /// Halt after this step completes.
    pub stop_after: Option<StepName>,
    /// Skip every step before this one.
    pub start_at_step: Option<StepName>,
}

impl StartOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `force_qa_fail`.
    #[must_use]
    pub fn with_force_qa_fail(mut self, force: bool) -> Self {
        self.force_qa_fail = force;
        self
    }

    /// Sets the loop bound.
    #[must_use]
    pub fn with_max_qa_loops(mut self, loops: u32) -> Self {
        self.max_qa_loops = Some(loops);
        self
    }

    /// Forces `count` failures of `step`.
    #[must_use]
    pub fn with_injected_failures(mut self, step: StepName, count: u32) -> Self {
        self.inject_failures.insert(step, count);
        self
    }

    /// Halts the run after `step`.
    #[must_use]
    pub fn with_stop_after(mut self, step: StepName) -> Self {
        self.stop_after = Some(step);
        self
    }

    /// Starts the run at `step`.
    #[must_use]
    pub fn with_start_at_step(mut self, step: StepName) -> Self {
        self.start_at_step = Some(step);
        self
    }
}

/// Options for continuing a run. Unset fields keep the persisted values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeOptions {
    /// Overrides the persisted `force_qa_fail`.
    pub force_qa_fail: Option<bool>,
    /// Overrides the persisted loop bound.
    pub max_qa_loops: Option<u32>,
    /// Forced failures per step for this invocation.
    pub inject_failures: BTreeMap<StepName, u32>,
    /// Halt after this step completes.
    pub stop_after: Option<StepName>,
}

impl ResumeOptions {
    /// Creates options that keep everything persisted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `force_qa_fail`.
    #[must_use]
    pub fn with_force_qa_fail(mut self, force: bool) -> Self {
        self.force_qa_fail = Some(force);
        self
    }

    /// Overrides the loop bound.
    #[must_use]
    pub fn with_max_qa_loops(mut self, loops: u32) -> Self {
        self.max_qa_loops = Some(loops);
        self
    }

    /// Forces `count` failures of `step`.
    #[must_use]
    pub fn with_injected_failures(mut self, step: StepName, count: u32) -> Self {
        self.inject_failures.insert(step, count);
        self
    }

    /// Halts the run after `step`.
    #[must_use]
    pub fn with_stop_after(mut self, step: StepName) -> Self {
        self.stop_after = Some(step);
        self
    }
}

/// How a `start` or `resume` call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalState {
    /// Succeeded or paused.
    pub status: RunStatus,
    /// The context after the last executed step.
    pub context: PipelineContext,
}

/// Removes the run from the active set when dropped.
struct ActiveRun<'a> {
    active: &'a DashSet<RunId>,
    run_id: RunId,
}

impl<'a> ActiveRun<'a> {
    fn acquire(active: &'a DashSet<RunId>, run_id: &RunId) -> Result<Self, EngineError> {
        if !active.insert(run_id.clone()) {
            return Err(EngineError::RunActive {
                run_id: run_id.clone(),
            });
        }
        Ok(Self {
            active,
            run_id: run_id.clone(),
        })
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

/// Durable pipeline engine.
///
/// `D` is the dependency bundle handed to every step (clients, handles,
/// settings). Runs of different ids may execute concurrently on one engine;
/// one run id executes at most once at a time.
pub struct Engine<D> {
    ledger: Arc<dyn AttemptLedger>,
    steps: StepSet<D>,
    deps: D,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
    graph: Option<GraphDriver>,
    sequential: SequentialDriver,
    coordinator: ResumeCoordinator,
    cache: StateCache,
    active: DashSet<RunId>,
}

impl<D> std::fmt::Debug for Engine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("steps", &self.steps)
            .field("graph", &self.graph.is_some())
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl<D: Send + Sync + 'static> Engine<D> {
    /// Starts building an engine around `deps`.
    #[must_use]
    pub fn builder(deps: D) -> EngineBuilder<D> {
        EngineBuilder::new(deps)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the attempt ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn AttemptLedger> {
        &self.ledger
    }

    /// Returns the state cache.
    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Starts a new run.
    ///
    /// Fails with `RunAlreadyStarted` if the ledger already holds rows for
    /// `run_id`, and with `StepFailed` if a step gives up.
    pub async fn start(
        &self,
        run_id: impl Into<RunId>,
        options: StartOptions,
    ) -> Result<FinalState, EngineError> {
        let run_id = run_id.into();
        let _active = ActiveRun::acquire(&self.active, &run_id)?;

        if self.ledger.latest(&run_id).await?.is_some() {
            return Err(EngineError::RunAlreadyStarted { run_id });
        }

        let controls = RunControls {
            force_qa_fail: options.force_qa_fail,
            max_qa_loops: options
                .max_qa_loops
                .unwrap_or(self.config.default_max_qa_loops),
        };
        let mut ctx = PipelineContext::new(run_id.clone())
            .with_controls(controls)
            .with_inject_failures(options.inject_failures)
            .with_stop_after(options.stop_after);
        if let Some(step) = options.start_at_step {
            ctx = ctx.starting_at(step);
        }

        tracing::info!(
            run_id = %run_id,
            force_qa_fail = controls.force_qa_fail,
            max_qa_loops = controls.max_qa_loops,
            "Run started"
        );
        self.events
            .emit(
                events::RUN_STARTED,
                Some(json!({
                    "run_id": run_id,
                    "controls": controls,
                    "start_at_step": options.start_at_step,
                })),
            )
            .await;

        self.execute(ctx).await
    }

    /// Continues a paused or failed run from its ledger.
    ///
    /// Fails with `RunNotFound` when the ledger has no rows and with
    /// `NothingToResume` when the run already completed.
    pub async fn resume(
        &self,
        run_id: impl Into<RunId>,
        options: ResumeOptions,
    ) -> Result<FinalState, EngineError> {
        let run_id = run_id.into();
        let _active = ActiveRun::acquire(&self.active, &run_id)?;

        let Some(latest) = self.ledger.latest(&run_id).await? else {
            return Err(EngineError::RunNotFound { run_id });
        };
        if latest.is_terminal_ok() {
            return Err(EngineError::NothingToResume { run_id });
        }

        let (mut ctx, cursor) = self.coordinator.resume_from(&run_id).await?;
        let Some(resume_at) = StepName::at(cursor) else {
            return Err(EngineError::NothingToResume { run_id });
        };

        if let Some(force) = options.force_qa_fail {
            ctx.controls.force_qa_fail = force;
        }
        if let Some(loops) = options.max_qa_loops {
            ctx.controls.max_qa_loops = loops;
        }
        ctx.inject_failures = options.inject_failures;
        ctx.stop_after = options.stop_after;

        tracing::info!(
            run_id = %run_id,
            resume_at = %resume_at,
            next_step_index = ctx.next_step_index,
            "Run resumed"
        );
        self.events
            .emit(
                events::RUN_RESUMED,
                Some(json!({
                    "run_id": run_id,
                    "resume_at": resume_at,
                    "next_step_index": ctx.next_step_index,
                })),
            )
            .await;

        self.execute(ctx).await
    }

    /// Returns every attempt of the run ordered by `(step_index, attempt)`.
    ///
    /// An unknown run has an empty history.
    pub async fn get_history(
        &self,
        run_id: impl Into<RunId>,
    ) -> Result<Vec<HistoryEntry>, EngineError> {
        let rows = self.ledger.history(&run_id.into()).await?;
        Ok(rows.iter().map(HistoryEntry::from).collect())
    }

    /// Returns the run's current context.
    ///
    /// Served from the cache while it matches the ledger's latest row,
    /// otherwise rebuilt from the ledger.
    pub async fn get_state(&self, run_id: impl Into<RunId>) -> Result<PipelineContext, EngineError> {
        let run_id = run_id.into();
        let Some(latest) = self.ledger.latest(&run_id).await? else {
            return Err(EngineError::RunNotFound { run_id });
        };
        if let Some(ctx) = self.cache.get_current(&run_id, latest.mark()) {
            return Ok(ctx);
        }

        let (ctx, _) = self.coordinator.resume_from(&run_id).await?;
        self.cache.insert(run_id, latest.mark(), ctx.clone());
        Ok(ctx)
    }

    /// Returns the graph checkpoints written for a run, oldest first.
    ///
    /// Empty when no checkpointer is configured or the run never went
    /// through the graph driver.
    pub async fn get_checkpoints(
        &self,
        run_id: impl Into<RunId>,
    ) -> Result<Vec<Checkpoint>, EngineError> {
        match &self.graph {
            Some(graph) => Ok(graph.checkpointer().list(&run_id.into()).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Picks the driver for one invocation.
    ///
    /// Checkpointer readiness is checked here, once, before any step runs.
    async fn select_driver(&self, run_id: &RunId) -> Result<&dyn PipelineDriver<D>, EngineError> {
        match (self.config.driver, &self.graph) {
            (DriverKind::Sequential, _) | (DriverKind::Auto, None) => Ok(&self.sequential),
            (DriverKind::Graph, Some(graph)) => {
                graph.checkpointer().ensure_ready().await?;
                Ok(graph)
            }
            (DriverKind::Graph, None) => Err(CheckpointError::Unavailable(
                "graph driver requested but no checkpointer is configured".to_string(),
            )
            .into()),
            (DriverKind::Auto, Some(graph)) => match graph.checkpointer().ensure_ready().await {
                Ok(()) => Ok(graph),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Checkpointer unavailable, using sequential driver");
                    self.events
                        .emit(
                            events::DRIVER_FALLBACK,
                            Some(json!({ "run_id": run_id, "reason": e.to_string() })),
                        )
                        .await;
                    Ok(&self.sequential)
                }
            },
        }
    }

    async fn execute(&self, ctx: PipelineContext) -> Result<FinalState, EngineError> {
        let run_id = ctx.run_id.clone();
        let driver = self.select_driver(&run_id).await?;
        let span = tracing::info_span!("run", run_id = %run_id, driver = %driver.kind());

        let result = driver
            .drive(ctx, &self.steps, &self.deps)
            .instrument(span)
            .await;

        match result {
            Ok(ctx) => self.finish(ctx).await,
            Err(err) => {
                self.cache.invalidate(&run_id);
                tracing::error!(run_id = %run_id, error = %err, "Run failed");
                let mut payload = err.to_detail();
                payload["run_id"] = json!(run_id);
                self.events.emit(events::RUN_FAILED, Some(payload)).await;
                Err(err)
            }
        }
    }

    async fn finish(&self, ctx: PipelineContext) -> Result<FinalState, EngineError> {
        let run_id = ctx.run_id.clone();
        let status = if ctx.is_completed() {
            RunStatus::Succeeded
        } else {
            RunStatus::Paused
        };

        match self.ledger.latest(&run_id).await? {
            Some(latest) => self.cache.insert(run_id.clone(), latest.mark(), ctx.clone()),
            None => self.cache.invalidate(&run_id),
        }

        let payload = json!({
            "run_id": run_id,
            "last_step": ctx.history.last(),
            "steps_executed": ctx.history.len(),
            "qa_attempts": ctx.qa_attempts,
        });
        match status {
            RunStatus::Succeeded => {
                tracing::info!(run_id = %run_id, qa_attempts = ctx.qa_attempts, "Run completed");
                self.events.emit(events::RUN_COMPLETED, Some(payload)).await;
            }
            RunStatus::Paused => {
                tracing::info!(run_id = %run_id, last_step = ?ctx.history.last(), "Run paused");
                self.events.emit(events::RUN_PAUSED, Some(payload)).await;
            }
        }

        Ok(FinalState {
            status,
            context: ctx,
        })
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<D> {
    deps: D,
    ledger: Option<Arc<dyn AttemptLedger>>,
    steps: Option<StepSet<D>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    events: Option<Arc<dyn EventSink>>,
    config: EngineConfig,
}

impl<D: Send + Sync + 'static> EngineBuilder<D> {
    /// Creates a builder with the in-memory ledger and built-in steps.
    #[must_use]
    pub fn new(deps: D) -> Self {
        Self {
            deps,
            ledger: None,
            steps: None,
            checkpointer: None,
            events: None,
            config: EngineConfig::default(),
        }
    }

    /// Sets the attempt ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn AttemptLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the step implementations.
    #[must_use]
    pub fn with_steps(mut self, steps: StepSet<D>) -> Self {
        self.steps = Some(steps);
        self
    }

    /// Sets the checkpoint store, enabling the graph driver.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and builds the engine.
    pub fn build(self) -> Result<Engine<D>, EngineError> {
        self.config.validate()?;

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));
        let runner = StepRunner::new(ledger.clone(), self.config.retry.clone(), events.clone());

        Ok(Engine {
            graph: self
                .checkpointer
                .map(|checkpointer| GraphDriver::new(runner.clone(), checkpointer)),
            sequential: SequentialDriver::new(runner),
            coordinator: ResumeCoordinator::new(ledger.clone()),
            steps: self.steps.unwrap_or_else(StepSet::builtin),
            ledger,
            deps: self.deps,
            config: self.config,
            events,
            cache: StateCache::new(),
            active: DashSet::new(),
        })
    }
}
